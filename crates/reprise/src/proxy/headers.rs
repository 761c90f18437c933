//! Header names and hop-by-hop filtering.
//!
//! Reprise's own header names are compile-time `HeaderName` constants.

use crate::recording::HeaderEntry;
use hyper::header::{HeaderName, HeaderValue};
use hyper::Response;

pub static X_REPRISE_ERROR: HeaderName = HeaderName::from_static("x-reprise-error");
pub static X_REPRISE_REPLAYED: HeaderName = HeaderName::from_static("x-reprise-replayed");
pub static X_REPRISE_RECORDED: HeaderName = HeaderName::from_static("x-reprise-recorded");

pub static VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

/// Connection-scoped headers that never cross the proxy.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Extra names listed in `Connection` headers, lower-cased.
pub fn connection_listed(headers: &[HeaderEntry]) -> Vec<String> {
    headers
        .iter()
        .filter(|h| h.is("connection"))
        .filter_map(|h| std::str::from_utf8(&h.value).ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Headers safe to pass to the next hop, in their original order.
///
/// `extra_drop` names additional headers to omit (compared case-insensitively).
pub fn end_to_end<'a>(
    headers: &'a [HeaderEntry],
    extra_drop: &'a [&'a str],
) -> impl Iterator<Item = &'a HeaderEntry> + 'a {
    let listed = connection_listed(headers);
    headers.iter().filter(move |h| {
        !is_hop_by_hop(&h.name)
            && !extra_drop.iter().any(|d| h.is(d))
            && !listed.iter().any(|l| h.is(l))
    })
}

/// Extension trait for inserting Reprise headers into responses.
pub trait RepriseHeadersExt {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);
}

impl<B> RepriseHeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().insert(name.clone(), value.clone());
    }
}
