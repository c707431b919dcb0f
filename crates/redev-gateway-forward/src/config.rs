pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("backend url must be an absolute http(s) url, got '{0}'")]
    InvalidBaseUrl(String),
    #[error("backend timeout must be greater than zero")]
    ZeroTimeout,
}

/// Where the backend of record lives and how long one call may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    base_url: String,
    timeout_ms: u64,
}

impl BackendConfig {
    /// # Errors
    /// Returns [`ConfigError`] for a non-http(s) base url or a zero timeout.
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, ConfigError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let has_host = ["http://", "https://"].iter().any(|scheme| {
            trimmed
                .strip_prefix(scheme)
                .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('/'))
        });
        if !has_host {
            return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
        }
        if timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Self {
            base_url: trimmed.to_string(),
            timeout_ms,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn url_for(&self, route: &str) -> String {
        format!("{}{route}", self.base_url)
    }
}
