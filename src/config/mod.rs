//! Runtime configuration: build mode and server limits.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::router::RouteTableConfig;

/// Environment variable consulted by [`Mode::from_env`].
pub const MODE_ENV: &str = "ROUTEWAY_ENV";

/// Whether configuration mistakes abort startup or are logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    /// `production` in `ROUTEWAY_ENV` selects [`Mode::Production`]; anything
    /// else, including an unset variable, selects [`Mode::Development`].
    pub fn from_env() -> Self {
        Self::parse(std::env::var(MODE_ENV).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("production") => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Mode::Production
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Server-wide settings.
///
/// # Examples
///
/// ```
/// use routeway::config::{Mode, ServerConfig};
///
/// let config = ServerConfig::from_json(r#"{ "base": "/app", "mode": "production" }"#).unwrap();
/// assert_eq!(config.base, "/app");
/// assert_eq!(config.mode, Mode::Production);
/// assert_eq!(config.max_request_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path prefix every route is mounted under.
    pub base: String,
    pub mode: Mode,
    /// Largest request (head plus body) accepted before answering `413`.
    pub max_request_size: usize,
    /// Most header lines a request may carry.
    pub max_headers: usize,
    /// Header flush period for streaming responses, in milliseconds.
    pub header_flush_interval_ms: u64,
    /// Header set by a trusted TLS-terminating proxy, e.g. `X-Forwarded-Proto`.
    pub secure_proxy_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base: "/".to_owned(),
            mode: Mode::default(),
            max_request_size: 1024 * 1024,
            max_headers: 64,
            header_flush_interval_ms: 5_000,
            secure_proxy_header: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn header_flush_interval(&self) -> Duration {
        Duration::from_millis(self.header_flush_interval_ms)
    }

    /// Route table settings derived from this configuration.
    pub fn route_table(&self) -> RouteTableConfig {
        RouteTableConfig::new(self.base.clone()).mode(self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(Mode::parse(Some("production")), Mode::Production);
        assert_eq!(Mode::parse(Some(" PRODUCTION ")), Mode::Production);
        assert_eq!(Mode::parse(Some("staging")), Mode::Development);
        assert_eq!(Mode::parse(None), Mode::Development);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{ "max_headers": 10 }"#).unwrap();
        assert_eq!(config.max_headers, 10);
        assert_eq!(config.base, "/");
        assert_eq!(config.header_flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            ServerConfig::from_json("{ base: }"),
            Err(ConfigError::Parse(_))
        ));
        assert!(ServerConfig::from_json(r#"{ "mode": "chaos" }"#).is_err());
    }

    #[test]
    fn route_table_settings() {
        let config = ServerConfig {
            base: "/app".into(),
            mode: Mode::Production,
            ..ServerConfig::default()
        };
        let table = config.route_table();
        assert_eq!(table.base, "/app");
        assert_eq!(table.mode, Mode::Production);
    }
}
