//! Client configuration.
//!
//! Defaults suit a local backend; [`ClientConfig::from_env`] reads the
//! `LIVESYNC_*` variables and the builder methods override single fields.

use std::time::Duration;

use crate::error::ConfigError;
use crate::snapshot::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080";
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by the snapshot source and the live transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the HTTP API
    pub api_url: String,
    /// Base URL of the live channel endpoint
    pub ws_url: String,
    /// Bearer token (optional for unauthenticated local backends)
    pub token: Option<String>,
    /// How long `close` waits for a subscription to confirm teardown
    pub close_timeout: Duration,
    /// Retry policy for snapshot fetches
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            token: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_url: &str, ws_url: &str) -> Self {
        ClientConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Build a config from `LIVESYNC_*` environment variables, falling back
    /// to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup("LIVESYNC_API_URL") {
            config.api_url = non_empty("LIVESYNC_API_URL", url)?;
        }
        if let Some(url) = lookup("LIVESYNC_WS_URL") {
            config.ws_url = non_empty("LIVESYNC_WS_URL", url)?;
        }
        config.token = lookup("LIVESYNC_TOKEN").filter(|t| !t.is_empty());
        if let Some(ms) = lookup("LIVESYNC_CLOSE_TIMEOUT_MS") {
            config.close_timeout =
                Duration::from_millis(parse_number("LIVESYNC_CLOSE_TIMEOUT_MS", &ms)?);
        }
        if let Some(attempts) = lookup("LIVESYNC_MAX_ATTEMPTS") {
            let attempts = parse_number("LIVESYNC_MAX_ATTEMPTS", &attempts)?;
            config.retry.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        Ok(config)
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Absolute live channel address for an API path.
    pub fn ws_address(&self, path: &str) -> String {
        format!("{}{}", self.ws_url.trim_end_matches('/'), path)
    }

    /// Absolute HTTP URL for an API path.
    pub fn api_address(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }
}

fn non_empty(var: &'static str, value: String) -> Result<String, ConfigError> {
    let value = value.trim().trim_end_matches('/').to_string();
    if value.is_empty() {
        return Err(ConfigError::Empty { var });
    }
    Ok(value)
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}
