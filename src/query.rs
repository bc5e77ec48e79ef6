//! Query normalization and hashing helpers.

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a raw user query: trim surrounding whitespace, strip diacritical
/// marks (NFKD decomposition, combining marks dropped), lowercase.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// True when the string contains any code point from the Hebrew block
/// (U+0590–U+05FF). Drives the default language preference and whether a
/// translation is attempted downstream.
pub fn looks_rtl(q: &str) -> bool {
    q.chars().any(|c| ('\u{0590}'..='\u{05FF}').contains(&c))
}

/// SHA-256 hex digest, used for content hashes and cache-key discriminators.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncate a string to at most `max` bytes, backing off to the nearest
/// char boundary.
pub fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
