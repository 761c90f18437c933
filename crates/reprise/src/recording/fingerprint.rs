//! Request fingerprinting.
//!
//! A fingerprint is the SHA-256 of the request's normalized dimensions:
//! - method: ASCII upper-cased
//! - path: as received, lower-cased when `case_sensitive_path` is off
//! - query: raw `name=value` pairs (no percent-decoding) sorted by name then
//!   value, repeated keys preserved
//! - headers: only allow-listed names, compared case-insensitively; values kept
//!   in received order
//! - body: SHA-256 of the raw bytes, for non-empty bodies of unsafe methods
//!   when `match_body` is on
//!
//! Every component is tagged and length-prefixed before hashing, so distinct
//! component tuples cannot collide through concatenation.

use super::types::RecordedRequest;
use crate::config::FingerprintConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque, comparable request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Methods whose bodies never participate in the fingerprint.
pub fn is_safe_method(method: &str) -> bool {
    ["GET", "HEAD", "OPTIONS", "TRACE"]
        .iter()
        .any(|safe| method.eq_ignore_ascii_case(safe))
}

/// Derive the fingerprint of a request. Pure; never fails.
pub fn fingerprint(request: &RecordedRequest, config: &FingerprintConfig) -> Fingerprint {
    let mut hasher = Sha256::new();

    let method = request.method.to_ascii_uppercase();
    hash_tagged(&mut hasher, b"method", method.as_bytes());

    if config.case_sensitive_path {
        hash_tagged(&mut hasher, b"path", request.path().as_bytes());
    } else {
        hash_tagged(
            &mut hasher,
            b"path",
            request.path().to_ascii_lowercase().as_bytes(),
        );
    }

    let params = canonical_query(request.query());
    hash_len_prefixed(&mut hasher, b"query");
    hash_count(&mut hasher, params.len());
    for (name, value) in params {
        hash_len_prefixed(&mut hasher, name.as_bytes());
        hash_len_prefixed(&mut hasher, value.as_bytes());
    }

    let names = config.normalized_headers();
    hash_len_prefixed(&mut hasher, b"headers");
    hash_count(&mut hasher, names.len());
    for name in &names {
        let values: Vec<&[u8]> = request.header_values(name).collect();
        hash_len_prefixed(&mut hasher, name.as_bytes());
        hash_count(&mut hasher, values.len());
        for value in values {
            hash_len_prefixed(&mut hasher, value);
        }
    }

    if config.match_body && !request.body.is_empty() && !is_safe_method(&method) {
        let body_digest = Sha256::digest(&request.body);
        hash_tagged(&mut hasher, b"body", &body_digest);
    }

    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Split a raw query into sorted `(name, value)` pairs.
///
/// Empty segments are dropped and a segment without `=` has an empty value,
/// so `?` alone is the same as no query at all.
pub fn canonical_query(query: Option<&str>) -> Vec<(&str, &str)> {
    let Some(query) = query else {
        return Vec::new();
    };
    let mut params: Vec<(&str, &str)> = query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.split_once('=').unwrap_or((segment, "")))
        .collect();
    params.sort_unstable();
    params
}

fn hash_tagged(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hash_len_prefixed(hasher, tag);
    hash_len_prefixed(hasher, value);
}

fn hash_count(hasher: &mut Sha256, count: usize) {
    hasher.update((count as u64).to_le_bytes());
}

fn hash_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
