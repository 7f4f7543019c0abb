//! Persisted allow-list of self-hosted sites.
//!
//! The list is append-only: entries are never removed by the engine, so
//! membership only grows over a process lifetime and across restarts.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("trust store: io error - {0}")]
    Io(#[from] std::io::Error),

    #[error("trust store: malformed file {path:?} - {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("trust store: serialization error - {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    sites: Vec<String>,
}

impl TrustStore {
    /// Loads the store, treating a missing file as empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrustError> {
        let path = path.as_ref().to_path_buf();
        let sites = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str::<Vec<String>>(&raw).map_err(|source| TrustError::Malformed {
                path: path.clone(),
                source,
            })?
        } else {
            Vec::new()
        };

        Ok(Self { path, sites })
    }

    /// Loads the store and appends any `seed` entries not already present.
    pub fn open_with_seed(path: impl AsRef<Path>, seed: &[String]) -> Result<Self, TrustError> {
        let mut store = Self::open(path)?;
        for site in seed {
            store.append(site)?;
        }
        Ok(store)
    }

    pub fn contains(&self, site: &str) -> bool {
        self.sites.iter().any(|s| s == site)
    }

    /// Appends `site` and flushes to disk. Returns `false` if it was already trusted.
    pub fn append(&mut self, site: &str) -> Result<bool, TrustError> {
        if self.contains(site) {
            return Ok(false);
        }
        self.sites.push(site.to_string());
        if let Err(e) = self.flush() {
            self.sites.pop();
            return Err(e);
        }
        log::info!("trusted site added: {site}");
        Ok(true)
    }

    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), TrustError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.sites)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
