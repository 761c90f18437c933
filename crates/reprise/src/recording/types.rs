//! Types for recorded traffic - requests, responses and the exchanges pairing them.
//!
//! Everything here is stored byte-exact: bodies are raw bytes (base64 on disk)
//! and header values are raw octets, kept in the order they were received.

use super::fingerprint::Fingerprint;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};

/// A single header line. Duplicated names are separate entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "HeaderWire", try_from = "HeaderWire")]
pub struct HeaderEntry {
    pub name: String,
    pub value: Vec<u8>,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// On-disk shape of a header: `["name", "text"]` or `["name", {"base64": "..."}]`.
#[derive(Serialize, Deserialize)]
struct HeaderWire(String, HeaderValueWire);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum HeaderValueWire {
    Text(String),
    Binary { base64: String },
}

impl From<HeaderEntry> for HeaderWire {
    fn from(entry: HeaderEntry) -> Self {
        let value = match String::from_utf8(entry.value) {
            Ok(text) => HeaderValueWire::Text(text),
            Err(err) => HeaderValueWire::Binary {
                base64: BASE64.encode(err.into_bytes()),
            },
        };
        HeaderWire(entry.name, value)
    }
}

impl TryFrom<HeaderWire> for HeaderEntry {
    type Error = base64::DecodeError;

    fn try_from(wire: HeaderWire) -> Result<Self, Self::Error> {
        let value = match wire.1 {
            HeaderValueWire::Text(text) => text.into_bytes(),
            HeaderValueWire::Binary { base64 } => BASE64.decode(base64)?,
        };
        Ok(HeaderEntry {
            name: wire.0,
            value,
        })
    }
}

/// Copy a hyper header map into a header list.
///
/// `HeaderMap` keeps values grouped by name, so the list preserves the order
/// of values within one name but not the wire interleaving between names.
pub fn header_list(headers: &HeaderMap) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| HeaderEntry::new(name.as_str(), value.as_bytes()))
        .collect()
}

/// Inbound request as captured by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub method: String,
    /// Path plus optional `?query`, exactly as received.
    pub target: String,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(HeaderEntry::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// All values of a header, in received order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.is(name))
            .map(|h| h.value.as_slice())
    }
}

/// Response captured from the upstream (or replayed from a recording).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub status: u16,
    /// Reason phrase as sent by the upstream.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    /// Time the upstream took to answer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl RecordedResponse {
    pub fn new(status: u16) -> Self {
        let reason = hyper::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Bytes::new(),
            latency_ms: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(HeaderEntry::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// One recorded request/response pair. Never mutated once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub fingerprint: Fingerprint,
    pub sequence_index: usize,
    pub recorded_at: DateTime<Utc>,
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
