//! Upstream and connection pool configuration.

use super::protocol::Protocol;
use super::ConfigError;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UpstreamConfig {
    /// Base URL of the real service, e.g. `http://127.0.0.1:9000` or
    /// `https://api.example.com/v2`
    #[serde(default)]
    pub url: String,
    /// Budget for a complete upstream response (head and body)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Parsed, validated upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub protocol: Protocol,
    /// `host[:port]`
    pub authority: String,
    /// Path prefix without a trailing slash; empty for the root.
    pub base_path: String,
}

impl UpstreamTarget {
    /// Absolute URI for a request target (`/path?query`).
    pub fn join(&self, target: &str) -> String {
        let target = if target.starts_with('/') {
            target.to_string()
        } else {
            format!("/{target}")
        };
        format!(
            "{}://{}{}{}",
            self.protocol.as_str(),
            self.authority,
            self.base_path,
            target
        )
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Parse and validate the base URL.
    pub fn target(&self) -> Result<UpstreamTarget, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid("upstream.url", "is required"));
        }

        let uri: Uri = self.url.trim().parse().map_err(|e| {
            ConfigError::invalid("upstream.url", format!("'{}' is not a URL: {e}", self.url))
        })?;

        let scheme = uri.scheme_str().ok_or_else(|| {
            ConfigError::invalid(
                "upstream.url",
                format!("'{}' is missing a scheme (http or https)", self.url),
            )
        })?;
        let protocol = Protocol::from_scheme(scheme).ok_or_else(|| {
            ConfigError::invalid(
                "upstream.url",
                format!("unsupported scheme '{scheme}', expected http or https"),
            )
        })?;
        let authority = uri
            .authority()
            .ok_or_else(|| {
                ConfigError::invalid("upstream.url", format!("'{}' has no host", self.url))
            })?
            .to_string();
        if uri.query().is_some() {
            return Err(ConfigError::invalid(
                "upstream.url",
                "must not carry a query string",
            ));
        }

        Ok(UpstreamTarget {
            protocol,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}
