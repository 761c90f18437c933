//! Proxy mode and sequence consumption policies.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Process-wide proxy mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Always forward, record every exchange
    Record,
    /// Replay recordings, never contact the upstream
    ReplayOnly,
    /// Replay when a recording matches, otherwise forward and record
    #[default]
    Hybrid,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Record => "record",
            ProxyMode::ReplayOnly => "replay_only",
            ProxyMode::Hybrid => "hybrid",
        }
    }

    /// Whether recorded exchanges are served in this mode.
    pub fn replays(&self) -> bool {
        matches!(self, ProxyMode::ReplayOnly | ProxyMode::Hybrid)
    }

    /// Whether a miss may reach the upstream in this mode.
    pub fn forwards(&self) -> bool {
        matches!(self, ProxyMode::Record | ProxyMode::Hybrid)
    }
}

impl FromStr for ProxyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "record" => Ok(ProxyMode::Record),
            "replay_only" | "replay" => Ok(ProxyMode::ReplayOnly),
            "hybrid" => Ok(ProxyMode::Hybrid),
            other => Err(ConfigError::invalid(
                "recording.mode",
                format!("unknown mode '{other}', expected record, replay_only or hybrid"),
            )),
        }
    }
}

/// Which exchange of a sequence a lookup returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    /// Oldest unconsumed exchange; each replay advances the cursor
    #[default]
    Fifo,
    /// Always the most recently recorded exchange
    Latest,
}

impl ConsumptionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionPolicy::Fifo => "fifo",
            ConsumptionPolicy::Latest => "latest",
        }
    }
}

impl FromStr for ConsumptionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(ConsumptionPolicy::Fifo),
            "latest" => Ok(ConsumptionPolicy::Latest),
            other => Err(ConfigError::invalid(
                "recording.consumption",
                format!("unknown policy '{other}', expected fifo or latest"),
            )),
        }
    }
}

/// What a FIFO lookup returns once every exchange has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep serving the last exchange
    #[default]
    RepeatLast,
    /// Report the sequence as exhausted (a miss)
    Exhausted,
}

impl ExhaustionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustionPolicy::RepeatLast => "repeat_last",
            ExhaustionPolicy::Exhausted => "exhausted",
        }
    }
}

impl FromStr for ExhaustionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "repeat_last" => Ok(ExhaustionPolicy::RepeatLast),
            "exhausted" => Ok(ExhaustionPolicy::Exhausted),
            other => Err(ConfigError::invalid(
                "recording.exhaustion",
                format!("unknown policy '{other}', expected repeat_last or exhausted"),
            )),
        }
    }
}
