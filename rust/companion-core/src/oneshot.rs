//! Single-file mode, entered when the browser invokes the protocol handler
//! with an `atlassian-companion:` URL instead of opening a session.
//!
//! The URL carries a percent-encoded `{link}` object. The link points to a
//! metadata document describing one file. That file is downloaded, opened
//! and watched; each real edit is sent back with a direct multipart upload
//! until the close signal fires. There is no dispatcher and no registry:
//! the process owns exactly one file.

use crate::config::CompanionConfig;
use crate::desktop::DesktopShell;
use crate::digest::ContentDigest;
use crate::http::{self, TransferError};
use crate::upload::DirectUploader;
use crate::watcher::{FileChangeWatcher, WatchError};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const ONE_SHOT_ID: &str = "one-shot";

#[derive(Debug, Error)]
pub enum OneShotError {
    #[error("one-shot: no {0} URL given")]
    MissingUrl(String),

    #[error("one-shot: invalid payload - {0}")]
    InvalidPayload(String),

    #[error("one-shot: metadata fetch failed - {0}")]
    Metadata(#[source] TransferError),

    #[error("one-shot: download failed - {0}")]
    Download(#[source] TransferError),

    #[error("one-shot: watcher error - {0}")]
    Watch(#[from] WatchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchLink {
    pub link: String,
}

/// Metadata document the launch link points to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default)]
    pub file_id: Value,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub download_url: String,
    pub upload_url: String,
    #[serde(default)]
    pub companion_action_callback_url: Option<String>,
}

/// Returns the last argument starting with `scheme`, as a browser passes it.
pub fn find_protocol_url<I, S>(args: I, scheme: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .filter(|arg| arg.as_ref().starts_with(scheme))
        .last()
        .map(|arg| arg.as_ref().to_string())
}

/// Percent-decodes a protocol URL and parses the JSON object behind the scheme.
pub fn decode_payload(url: &str, scheme: &str) -> Result<LaunchLink, OneShotError> {
    let decoded = percent_decode_str(url)
        .decode_utf8()
        .map_err(|e| OneShotError::InvalidPayload(e.to_string()))?;
    let payload = decoded
        .strip_prefix(scheme)
        .ok_or_else(|| OneShotError::InvalidPayload(format!("missing {scheme} prefix")))?;
    let payload = payload.trim_start_matches('/');

    let link: LaunchLink = serde_json::from_str(payload)
        .map_err(|e| OneShotError::InvalidPayload(e.to_string()))?;
    if link.link.is_empty() {
        return Err(OneShotError::InvalidPayload("empty link".into()));
    }
    Ok(link)
}

/// A downloaded file ready to be opened and watched.
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub metadata: FileMetadata,
    pub path: PathBuf,
    pub digest: ContentDigest,
}

/// Outcome of a finished one-shot run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OneShotSummary {
    pub uploads: usize,
    pub failures: usize,
}

pub struct OneShot {
    config: Arc<CompanionConfig>,
    shell: Arc<dyn DesktopShell>,
    client: reqwest::Client,
    direct: DirectUploader,
}

impl OneShot {
    pub fn new(
        config: Arc<CompanionConfig>,
        shell: Arc<dyn DesktopShell>,
    ) -> Result<Self, OneShotError> {
        let client = http::build_client(&config.http).map_err(OneShotError::Download)?;
        Ok(Self {
            direct: DirectUploader::new(client.clone(), &config.http),
            config,
            shell,
            client,
        })
    }

    /// Decodes the URL, fetches the metadata and downloads the file.
    /// Every failure here is fatal for the process.
    pub async fn prepare(&self, url: &str) -> Result<PreparedFile, OneShotError> {
        let link = decode_payload(url, &self.config.protocol_scheme)?;
        log::info!("metadata link: {}", link.link);

        let metadata: FileMetadata = http::fetch_json(&self.client, &link.link)
            .await
            .map_err(OneShotError::Metadata)?;
        log::debug!("metadata: {metadata:?}");

        let path = self
            .config
            .cache_path_for(&metadata.file_name)
            .map_err(|e| OneShotError::InvalidPayload(e.to_string()))?;

        log::info!("downloading {} to {}", metadata.download_url, path.display());
        let digest = http::download_to(&self.client, &metadata.download_url, &path)
            .await
            .map_err(OneShotError::Download)?;

        Ok(PreparedFile {
            metadata,
            path,
            digest,
        })
    }

    /// Runs the whole edit cycle until `close` completes.
    pub async fn run<F>(&self, url: &str, close: F) -> Result<OneShotSummary, OneShotError>
    where
        F: Future<Output = ()>,
    {
        let prepared = self.prepare(url).await?;
        self.watch(prepared, close).await
    }

    /// Opens an already downloaded file and uploads its edits until `close`.
    pub async fn watch<F>(
        &self,
        prepared: PreparedFile,
        close: F,
    ) -> Result<OneShotSummary, OneShotError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.shell.open(&prepared.path) {
            log::warn!("could not open {}: {e}", prepared.path.display());
        }

        let (mut watcher, mut changes) =
            FileChangeWatcher::start(self.config.watcher.channel_capacity)?;
        watcher.track(ONE_SHOT_ID, &prepared.path, prepared.digest)?;

        tokio::pin!(close);
        let mut summary = OneShotSummary::default();
        loop {
            tokio::select! {
                _ = close.as_mut() => break,
                signal = changes.recv() => {
                    let Some(signal) = signal else { break };
                    log::info!("{} changed ({})", signal.path.display(), signal.digest);
                    if self.upload(&prepared).await {
                        summary.uploads += 1;
                    } else {
                        summary.failures += 1;
                    }
                }
            }
        }

        watcher.untrack_all();
        log::info!(
            "editing of {} ended: {} upload(s), {} failure(s)",
            prepared.metadata.file_name,
            summary.uploads,
            summary.failures
        );
        Ok(summary)
    }

    async fn upload(&self, prepared: &PreparedFile) -> bool {
        let metadata = &prepared.metadata;
        let result = match tokio::fs::read(&prepared.path).await {
            Ok(content) => {
                self.direct
                    .upload(&metadata.upload_url, &metadata.file_name, content)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                self.shell.notify("File uploaded successfully");
                true
            }
            Err(e) => {
                log::warn!("upload of {} failed: {e}", metadata.file_name);
                self.shell.notify("File upload failed");
                false
            }
        }
    }
}
