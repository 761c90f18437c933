//! Record/replay storage for proxied HTTP exchanges.
//!
//! Supports three modes:
//! - `record`: Always forward, record every exchange
//! - `replay_only`: Serve recordings, never contact the upstream
//! - `hybrid`: Serve recordings when they match, otherwise forward and record
//!
//! # Module Structure
//!
//! - `mode` - Proxy mode and sequence policies
//! - `types` - Recorded request, response and exchange types
//! - `fingerprint` - Request fingerprint derivation
//! - `persistence` - Durable exchange log backends
//! - `store` - In-memory exchange store with per-fingerprint cursors

mod fingerprint;
mod mode;
mod persistence;
mod store;
mod types;

pub use fingerprint::{canonical_query, fingerprint, is_safe_method, Fingerprint};
pub use mode::{ConsumptionPolicy, ExhaustionPolicy, ProxyMode};
pub use persistence::{ExchangeLog, FileExchangeLog, MemoryExchangeLog, PersistenceError};
pub use store::{ExchangeStore, Lookup};
pub use types::{header_list, Exchange, HeaderEntry, RecordedRequest, RecordedResponse};
