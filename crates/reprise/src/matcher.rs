//! Request matching against the recorded exchanges.
//!
//! [`match_request`] claims a slot from the store; [`peek`] looks without
//! moving any cursor.

use crate::config::FingerprintConfig;
use crate::recording::{fingerprint, Exchange, ExchangeStore, Fingerprint, Lookup, RecordedRequest};
use std::sync::Arc;

/// Outcome of matching an inbound request against the recordings.
#[derive(Debug, Clone)]
pub enum MatchResult {
    Hit(Arc<Exchange>),
    /// Nothing recorded, or the sequence is exhausted
    Miss,
}

impl MatchResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, MatchResult::Hit(_))
    }
}

impl From<Lookup> for MatchResult {
    fn from(lookup: Lookup) -> Self {
        match lookup {
            Lookup::Found(exchange) => MatchResult::Hit(exchange),
            Lookup::Exhausted | Lookup::NotFound => MatchResult::Miss,
        }
    }
}

/// Fingerprint `request` and claim the exchange it replays, advancing the cursor.
///
/// The fingerprint is returned alongside so a miss can be recorded under it.
pub fn match_request(
    request: &RecordedRequest,
    store: &ExchangeStore,
    config: &FingerprintConfig,
) -> (Fingerprint, MatchResult) {
    let fp = fingerprint(request, config);
    let result = store.claim(&fp).into();
    (fp, result)
}

/// Like [`match_request`], but leaves the cursor where it is.
pub fn peek(
    request: &RecordedRequest,
    store: &ExchangeStore,
    config: &FingerprintConfig,
) -> MatchResult {
    store.lookup(&fingerprint(request, config)).into()
}
