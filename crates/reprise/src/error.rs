//! Fatal startup errors and the process exit codes they map to.

use crate::config::ConfigError;
use crate::recording::PersistenceError;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load recordings: {0}")]
    State(#[from] PersistenceError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::State(_) => 3,
            StartupError::Bind { .. } => 4,
        }
    }
}
