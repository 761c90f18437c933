//! Recording configuration for record/replay.

use crate::recording::{ConsumptionPolicy, ExhaustionPolicy, ProxyMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingConfig {
    /// Proxy mode: record, replay_only, or hybrid (default)
    #[serde(default)]
    pub mode: ProxyMode,

    /// Which exchange of a sequence a replay serves
    #[serde(default)]
    pub consumption: ConsumptionPolicy,

    /// What a FIFO replay serves once a sequence is used up
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,

    /// JSON Lines log of recorded exchanges. Omitted means in-memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// fsync each appended record before it is published
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Rewrite the log as a compacted snapshot on graceful shutdown
    #[serde(default)]
    pub snapshot_on_shutdown: bool,

    /// Status returned in replay_only mode when nothing matches
    #[serde(default = "default_no_recording_status")]
    pub no_recording_status: u16,

    /// Mark replayed and freshly recorded responses with x-reprise-* headers
    #[serde(default)]
    pub annotate_responses: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            consumption: ConsumptionPolicy::default(),
            exhaustion: ExhaustionPolicy::default(),
            path: None,
            fsync: true,
            snapshot_on_shutdown: false,
            no_recording_status: default_no_recording_status(),
            annotate_responses: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_no_recording_status() -> u16 {
    502
}
