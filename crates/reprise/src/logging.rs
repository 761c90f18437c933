//! Tracing subscriber setup.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogFormat, LoggingConfig};

/// Filter from `RUST_LOG` when set, otherwise from `logging.level`.
pub fn resolve_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    parse_level(&config.level)
}

/// Parse a filter directive such as `info` or `reprise=debug,hyper=warn`.
pub fn parse_level(level: &str) -> Result<EnvFilter, ConfigError> {
    let normalized = level.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ConfigError::invalid("logging.level", "must not be empty"));
    }
    EnvFilter::try_new(&normalized).map_err(|e| {
        ConfigError::invalid(
            "logging.level",
            format!("invalid filter `{level}`: {e}"),
        )
    })
}

/// Install the global subscriber. Call once, from `main`.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = resolve_filter(config)?;

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}
