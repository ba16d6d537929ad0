//! Runtime settings for the stores and the HTTP transport.
//!
//! Later layers win: built-in defaults, a TOML file named by
//! `SCRAPEKIT_CONFIG_FILE`, then `SCRAPEKIT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

const ENV_PREFIX: &str = "SCRAPEKIT_";
const CONFIG_FILE_VAR: &str = "SCRAPEKIT_CONFIG_FILE";

/// Every store handle is constructed from one of these; nothing reads the
/// environment after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding cached payloads and their metadata.
    ///
    /// Set via SCRAPEKIT_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Path to the SQLite once-ledger database.
    ///
    /// Set via SCRAPEKIT_LEDGER_PATH environment variable.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Seconds after a fetch during which the cached payload is served
    /// without touching the network.
    ///
    /// Set via SCRAPEKIT_FRESHNESS_SECS environment variable.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via SCRAPEKIT_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via SCRAPEKIT_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum bytes to fetch per request.
    ///
    /// Set via SCRAPEKIT_MAX_BYTES environment variable.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Maximum number of redirects to follow.
    ///
    /// Set via SCRAPEKIT_MAX_REDIRECTS environment variable.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Entries kept per cohort by ledger cleanup.
    ///
    /// Set via SCRAPEKIT_RETENTION_LIMIT environment variable.
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,

    /// Rows loaded per page while enumerating pending ledger entries.
    ///
    /// Set via SCRAPEKIT_PAGE_SIZE environment variable.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./cache.sqlite")
}

fn default_freshness_secs() -> u64 {
    45
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; scrapekit/0.1)".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_max_redirects() -> usize {
    5
}

fn default_retention_limit() -> usize {
    200
}

fn default_page_size() -> usize {
    64
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ledger_path: default_ledger_path(),
            freshness_secs: default_freshness_secs(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
            max_redirects: default_max_redirects(),
            retention_limit: default_retention_limit(),
            page_size: default_page_size(),
        }
    }
}

impl AppConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    /// Provider stack: defaults, then the optional TOML file, then
    /// `SCRAPEKIT_*` variables (`__` separates nested keys).
    pub fn figment(config_file: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = config_file {
            if !path.is_file() {
                return Err(ConfigError::Missing(path.display().to_string()));
            }
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment.merge(
            Env::prefixed(ENV_PREFIX)
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        ))
    }

    /// Load and validate, reading the file named by `SCRAPEKIT_CONFIG_FILE` if set.
    pub fn load() -> Result<Self, ConfigError> {
        let config_file = std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from);
        let config: Self = Self::figment(config_file.as_deref())?
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }
}
