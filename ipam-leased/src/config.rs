use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::MAX_RETENTION_DAYS;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub netbox: NetboxConfig,
    pub cipher: CipherConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetboxConfig {
    pub url: String,
    /// Inline API token. `token_path` wins when both are set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Custom field choice set listing the zones
    #[serde(default = "default_zone_choice_set")]
    pub zone_choice_set: String,
    /// Custom field on container prefixes naming their zone
    #[serde(default = "default_zone_field")]
    pub zone_field: String,
    /// Only containers carrying this tag are used
    #[serde(default)]
    pub constraint_tag: Option<String>,
    #[serde(default = "default_ready_retry")]
    pub ready_retry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CipherConfig {
    /// Hex-encoded 32-byte key
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// 0 disables periodic refresh; the cache is then only filled at startup
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_retention")]
    pub max_retention_days: u32,
}

fn default_timeout() -> u64 {
    5
}

fn default_zone_choice_set() -> String {
    "k8s_zone_choices".to_string()
}

fn default_zone_field() -> String {
    "k8s_zone".to_string()
}

fn default_ready_retry() -> u64 {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ipam-leased/addresses.db")
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_listen() -> String {
    "[::]:8080".to_string()
}

fn default_max_retention() -> u32 {
    MAX_RETENTION_DAYS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_retention_days: default_max_retention(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        if config.cleanup.interval_secs == 0 {
            bail!("cleanup.interval_secs must be greater than zero");
        }
        if config.netbox.timeout_secs == 0 {
            bail!("netbox.timeout_secs must be greater than zero");
        }
        if config.netbox.ready_retry_secs == 0 {
            bail!("netbox.ready_retry_secs must be greater than zero");
        }
        if config.api.max_retention_days > MAX_RETENTION_DAYS {
            bail!(
                "api.max_retention_days cannot exceed {} days",
                MAX_RETENTION_DAYS
            );
        }

        Ok(config)
    }
}

impl NetboxConfig {
    /// Resolve the API token, reading `token_path` if configured
    pub fn resolve_token(&self) -> Result<String> {
        read_secret(self.token.as_deref(), self.token_path.as_deref())
            .context("Netbox token is not configured")
    }
}

impl CipherConfig {
    /// Resolve the raw 32-byte cipher key
    pub fn resolve_key(&self) -> Result<[u8; 32]> {
        let encoded = read_secret(self.key.as_deref(), self.key_path.as_deref())
            .context("Cipher key is not configured")?;

        let bytes = hex::decode(&encoded).context("Cipher key is not valid hex")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("Cipher key must be 32 bytes, got {}", b.len()))?;

        Ok(key)
    }
}

/// File contents take precedence over the inline value. Surrounding
/// whitespace is stripped, mounted secrets often end in a newline.
fn read_secret(inline: Option<&str>, path: Option<&Path>) -> Result<String> {
    if let Some(path) = path {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secret file: {}", path.display()))?;
        return Ok(contents.trim().to_string());
    }

    match inline {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => bail!("neither an inline value nor a file path is set"),
    }
}
