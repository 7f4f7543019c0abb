use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "companion.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_protocol_scheme")]
    pub protocol_scheme: String,

    #[serde(default = "default_trusted_sites_file")]
    pub trusted_sites_file: String,

    /// Site names appended to the trust store at startup.
    #[serde(default)]
    pub preapproved_sites: Vec<String>,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_cloud_base_url")]
    pub base_url: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: default_cloud_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    #[serde(default = "default_upload_comment")]
    pub upload_comment: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            accept_language: default_accept_language(),
            upload_comment: default_upload_comment(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// PEM certificate chain and PKCS#8 key for serving `wss://`.
/// Both unset means plain `ws://`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.cert_path.is_some() || self.key_path.is_some()
    }
}

// Defaults
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".companion"))
        .unwrap_or_else(|| PathBuf::from(".companion"))
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|c| c.join("companion").join("tmp"))
        .unwrap_or_else(|| PathBuf::from(".companion-cache"))
}

fn default_listen_addr() -> String {
    "127.0.0.1:22274".to_string()
}
fn default_protocol_scheme() -> String {
    "atlassian-companion:".to_string()
}
fn default_trusted_sites_file() -> String {
    "trusted_sites.json".to_string()
}
fn default_cloud_base_url() -> String {
    "https://api.media.atlassian.com".to_string()
}
fn default_timeout() -> u64 {
    60
}
fn default_accept_language() -> String {
    "en".to_string()
}
fn default_upload_comment() -> String {
    "Uploaded by Companion".to_string()
}
fn default_user_agent() -> String {
    format!("companion/{}", env!("CARGO_PKG_VERSION"))
}
fn default_channel_capacity() -> usize {
    64
}

impl CompanionConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            let mut config: CompanionConfig = serde_json::from_str(&raw)?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            cache_dir: default_cache_dir(),
            listen_addr: default_listen_addr(),
            protocol_scheme: default_protocol_scheme(),
            trusted_sites_file: default_trusted_sites_file(),
            preapproved_sites: Vec::new(),
            cloud: CloudConfig::default(),
            http: HttpConfig::default(),
            watcher: WatcherConfig::default(),
            tls: TlsConfig::default(),
        }
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE_NAME);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }

    /// Creates the data and cache directories and canonicalizes `cache_dir`,
    /// so that paths derived from it compare equal to watcher event paths.
    pub fn ensure_directories(&mut self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.cache_dir)?;
        self.cache_dir = fs::canonicalize(&self.cache_dir)?;
        Ok(())
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.data_dir.join(&self.trusted_sites_file)
    }

    /// Location of the cached copy for a browser-supplied file name.
    ///
    /// Directory components are stripped so a name can never escape the
    /// cache directory. Same names map to the same path (overwrite).
    pub fn cache_path_for(&self, file_name: &str) -> Result<PathBuf> {
        let name = Path::new(file_name)
            .file_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow!("invalid file name: {file_name:?}"))?;
        Ok(self.cache_dir.join(name))
    }
}
