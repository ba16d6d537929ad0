use crate::config::AppConfig;
use thiserror::Error;

const TIMEOUT_MS_RANGE: std::ops::RangeInclusive<u64> = 100..=300_000;
const MAX_REDIRECTS: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("configuration file not found: {0}")]
    Missing(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Reject values the stores and transport cannot work with.
    ///
    /// A zero freshness window is allowed (every `get` revalidates) but logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !TIMEOUT_MS_RANGE.contains(&self.timeout_ms) {
            return Err(invalid(
                "timeout_ms",
                format!("must be between {} and {}", TIMEOUT_MS_RANGE.start(), TIMEOUT_MS_RANGE.end()),
            ));
        }
        if self.max_redirects > MAX_REDIRECTS {
            return Err(invalid("max_redirects", format!("must be at most {MAX_REDIRECTS}")));
        }

        for (field, value) in [
            ("max_bytes", self.max_bytes),
            ("retention_limit", self.retention_limit),
            ("page_size", self.page_size),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        if self.user_agent.trim().is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }
        if self.cache_dir == self.ledger_path {
            return Err(invalid("ledger_path", "must differ from cache_dir"));
        }

        if self.freshness_secs == 0 {
            tracing::warn!("freshness_secs is 0; every request will revalidate against the network");
        }
        Ok(())
    }
}
