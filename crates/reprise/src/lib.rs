//! Reprise: an HTTP proxy that records upstream exchanges and replays them.

pub mod config;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod proxy;
pub mod recording;
pub mod response;

pub use config::Config;
pub use error::StartupError;
pub use proxy::{BoundProxy, ProxyServer};
