//! Which request dimensions make up a fingerprint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FingerprintConfig {
    /// Header names (case-insensitive) that take part in matching. Every other
    /// header is ignored.
    #[serde(default)]
    pub headers_to_match: Vec<String>,

    /// Hash the body of non-safe methods
    #[serde(default = "default_true")]
    pub match_body: bool,

    #[serde(default = "default_true")]
    pub case_sensitive_path: bool,
}

impl FingerprintConfig {
    /// Allow-list lower-cased, sorted and deduplicated.
    pub fn normalized_headers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .headers_to_match
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            headers_to_match: Vec::new(),
            match_body: true,
            case_sensitive_path: true,
        }
    }
}

fn default_true() -> bool {
    true
}
