//! Configuration types for the Reprise proxy.

mod fingerprint;
mod listen;
mod logging;
mod protocol;
mod recording;
mod upstream;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use fingerprint::FingerprintConfig;
pub use listen::{ListenConfig, MetricsConfig};
pub use logging::{LogFormat, LoggingConfig};
pub use protocol::Protocol;
pub use recording::RecordingConfig;
pub use upstream::{ConnectionPoolConfig, UpstreamConfig, UpstreamTarget};

use crate::recording::ProxyMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Command-line / environment values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub upstream_url: Option<String>,
    pub mode: Option<ProxyMode>,
    pub recording_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load without validating; call [`Config::validate`] once overrides are applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(host) = overrides.listen_host {
            self.listen.host = host;
        }
        if let Some(port) = overrides.listen_port {
            self.listen.port = port;
        }
        if let Some(url) = overrides.upstream_url {
            self.upstream.url = url;
        }
        if let Some(mode) = overrides.mode {
            self.recording.mode = mode;
        }
        if let Some(path) = overrides.recording_path {
            self.recording.path = Some(path);
        }
        if let Some(port) = overrides.metrics_port {
            self.metrics.enabled = true;
            self.metrics.port = port;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.socket_addr()?;
        self.upstream.target()?;

        if self.upstream.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "upstream.timeout_ms",
                "must be greater than zero",
            ));
        }

        let status = self.recording.no_recording_status;
        if !(400..=599).contains(&status) {
            return Err(ConfigError::invalid(
                "recording.no_recording_status",
                format!("{status} is not a 4xx or 5xx status"),
            ));
        }

        // Port 0 asks the OS for an ephemeral port, so two zeros never clash.
        if self.metrics.enabled && self.metrics.port != 0 && self.metrics.port == self.listen.port {
            return Err(ConfigError::invalid(
                "metrics.port",
                format!("{} is already used by the proxy listener", self.metrics.port),
            ));
        }

        if let Some(ref path) = self.recording.path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid("recording.path", "must not be empty"));
            }
        }

        crate::logging::parse_level(&self.logging.level)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ConsumptionPolicy, ExhaustionPolicy};

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listen:
  host: 0.0.0.0
  port: 8081
upstream:
  url: "http://127.0.0.1:9000"
  timeout_ms: 1500
recording:
  mode: replay_only
  consumption: latest
  exhaustion: exhausted
  path: /tmp/recordings.jsonl
  fsync: false
  no_recording_status: 404
fingerprint:
  headers_to_match: ["Accept", "X-Tenant"]
  match_body: false
metrics:
  enabled: true
  port: 9191
logging:
  level: debug
  format: json
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.listen.port, 8081);
        assert_eq!(config.upstream.timeout_ms, 1500);
        assert_eq!(config.recording.mode, ProxyMode::ReplayOnly);
        assert_eq!(config.recording.consumption, ConsumptionPolicy::Latest);
        assert_eq!(config.recording.exhaustion, ExhaustionPolicy::Exhausted);
        assert_eq!(
            config.recording.path,
            Some(PathBuf::from("/tmp/recordings.jsonl"))
        );
        assert!(!config.recording.fsync);
        assert_eq!(config.recording.no_recording_status, 404);
        assert_eq!(config.fingerprint.headers_to_match.len(), 2);
        assert!(!config.fingerprint.match_body);
        assert!(config.fingerprint.case_sensitive_path);
        assert!(config.metrics.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("upstream:\n  url: http://localhost:9000\n").unwrap();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.upstream.timeout_ms, 30_000);
        assert_eq!(config.recording.mode, ProxyMode::Hybrid);
        assert_eq!(config.recording.consumption, ConsumptionPolicy::Fifo);
        assert_eq!(config.recording.exhaustion, ExhaustionPolicy::RepeatLast);
        assert!(config.recording.path.is_none());
        assert!(config.recording.fsync);
        assert!(!config.recording.annotate_responses);
        assert_eq!(config.recording.no_recording_status, 502);
        assert!(config.fingerprint.headers_to_match.is_empty());
        assert!(config.fingerprint.match_body);
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.listen.port, 8080);
    }

    #[test]
    fn test_unknown_mode_is_parse_error() {
        let yaml = "recording:\n  mode: proxyOnce\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_upstream_url_is_invalid() {
        let config = Config::default();
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "upstream.url"),
            other => panic!("expected invalid upstream.url, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_failures() {
        let base = Config::from_yaml("upstream:\n  url: http://127.0.0.1:9000\n").unwrap();

        let mut zero_timeout = base.clone();
        zero_timeout.upstream.timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());

        let mut ok_status = base.clone();
        ok_status.recording.no_recording_status = 200;
        assert!(ok_status.validate().is_err());

        let mut bad_host = base.clone();
        bad_host.listen.host = "not an ip".to_string();
        assert!(bad_host.validate().is_err());

        let mut clash = base.clone();
        clash.metrics.enabled = true;
        clash.metrics.port = clash.listen.port;
        assert!(clash.validate().is_err());

        let mut ephemeral = clash.clone();
        ephemeral.listen.port = 0;
        ephemeral.metrics.port = 0;
        ephemeral.validate().unwrap();

        let mut bad_scheme = base;
        bad_scheme.upstream.url = "ftp://127.0.0.1".to_string();
        assert!(bad_scheme.validate().is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = Config::from_yaml("listen:\n  port: 8080\n").unwrap();
        config.apply_overrides(Overrides {
            listen_port: Some(18080),
            upstream_url: Some("http://127.0.0.1:9999".to_string()),
            mode: Some(ProxyMode::Record),
            recording_path: Some(PathBuf::from("out.jsonl")),
            metrics_port: Some(19090),
            ..Overrides::default()
        });

        assert_eq!(config.listen.port, 18080);
        assert_eq!(config.upstream.url, "http://127.0.0.1:9999");
        assert_eq!(config.recording.mode, ProxyMode::Record);
        assert_eq!(config.recording.path, Some(PathBuf::from("out.jsonl")));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 19090);
        config.validate().unwrap();
    }

    #[test]
    fn test_read_error_carries_path() {
        match Config::from_file("/definitely/not/here.yaml") {
            Err(ConfigError::Read { path, .. }) => {
                assert_eq!(path, PathBuf::from("/definitely/not/here.yaml"))
            }
            other => panic!("expected read error, got {other:?}"),
        }
    }
}
