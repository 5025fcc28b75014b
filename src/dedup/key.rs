//! Canonical deduplication keys.
//!
//! A key is `METHOD|normalized-url|body-hash|header-hash`. Two requests with
//! the same key are treated as the same logical idempotent request.

use std::collections::{BTreeMap, HashSet};

use sha2::{Digest, Sha256};
use url::Url;

use crate::request::Method;

/// Hash used when a request has no body.
pub const EMPTY_BODY_HASH: &str = "empty";

/// Hash used when no relevant headers remain after filtering.
pub const EMPTY_HEADERS_HASH: &str = "none";

/// Headers that vary per call without changing the response.
pub const DEFAULT_IGNORE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-request-id",
    "x-correlation-id",
    "x-trace-id",
    "user-agent",
    "accept-encoding",
    "connection",
    "cache-control",
];

const RELATIVE_BASE: &str = "http://dispatch.local";

/// Only idempotent methods may share an execution.
pub fn is_deduplicatable(method: Method) -> bool {
    method.is_idempotent()
}

/// 32-bit order-sensitive rolling hash (`h = h * 31 + c`).
pub fn rolling_hash(input: &str) -> u32 {
    input
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

/// Derives deduplication keys from request parts.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    ignore_headers: HashSet<String>,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_HEADERS.iter().copied())
    }
}

impl KeyGenerator {
    /// Build a generator that drops the given headers (case-insensitive).
    pub fn new<I, S>(ignore_headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignore_headers: ignore_headers
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn generate_key(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&serde_json::Value>,
    ) -> String {
        format!(
            "{}|{}|{}|{}",
            method,
            normalize_url(url),
            hash_body(body),
            self.hash_headers(headers)
        )
    }

    /// Hash of the sorted `name:value` pairs that survive the ignore list.
    pub fn hash_headers(&self, headers: &BTreeMap<String, String>) -> String {
        let mut relevant: Vec<(String, &str)> = headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim()))
            .filter(|(k, _)| !self.ignore_headers.contains(k))
            .collect();
        if relevant.is_empty() {
            return EMPTY_HEADERS_HASH.to_string();
        }
        relevant.sort();

        let joined = relevant
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("|");
        let digest = Sha256::digest(joined.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Path plus query string with parameters sorted by name.
///
/// Absolute URLs keep their origin so identical paths on different hosts
/// never collide. Unparseable input is returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let (parsed, absolute) = match Url::parse(raw) {
        Ok(url) if url.has_host() => (url, true),
        _ => match Url::parse(RELATIVE_BASE).and_then(|base| base.join(raw)) {
            Ok(url) => (url, false),
            Err(_) => return raw.to_string(),
        },
    };

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    // Stable: repeated parameters keep their relative order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut normalized = String::new();
    if absolute {
        normalized.push_str(&parsed.origin().ascii_serialization());
    }
    normalized.push_str(parsed.path());
    if !pairs.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        normalized.push('?');
        normalized.push_str(&query);
    }
    normalized
}

/// Rolling hash of the serialized body, or [`EMPTY_BODY_HASH`].
pub fn hash_body(body: Option<&serde_json::Value>) -> String {
    let serialized = match body {
        None | Some(serde_json::Value::Null) => return EMPTY_BODY_HASH.to_string(),
        Some(serde_json::Value::String(s)) if s.is_empty() => {
            return EMPTY_BODY_HASH.to_string()
        }
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    format!("{:08x}", rolling_hash(&serialized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(normalize_url("/x?b=2&a=1"), normalize_url("/x?a=1&b=2"));
        assert_eq!(normalize_url("/x?b=2&a=1"), "/x?a=1&b=2");
    }

    #[test]
    fn repeated_params_keep_relative_order() {
        assert_eq!(normalize_url("/x?a=2&z=1&a=1"), "/x?a=2&a=1&z=1");
    }

    #[test]
    fn fragment_is_dropped() {
        assert_eq!(normalize_url("/x?a=1#frag"), "/x?a=1");
    }

    #[test]
    fn absolute_urls_keep_origin() {
        assert_eq!(
            normalize_url("https://api.example.com/v1/items?b=1&a=2"),
            "https://api.example.com/v1/items?a=2&b=1"
        );
        assert_ne!(
            normalize_url("https://a.example.com/x"),
            normalize_url("https://b.example.com/x")
        );
    }

    #[test]
    fn empty_body_uses_sentinel() {
        assert_eq!(hash_body(None), EMPTY_BODY_HASH);
        assert_eq!(hash_body(Some(&json!(null))), EMPTY_BODY_HASH);
        assert_eq!(hash_body(Some(&json!(""))), EMPTY_BODY_HASH);
        assert_ne!(hash_body(Some(&json!({"a": 1}))), EMPTY_BODY_HASH);
    }

    #[test]
    fn rolling_hash_is_order_sensitive() {
        assert_ne!(rolling_hash("ab"), rolling_hash("ba"));
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
    }

    #[test]
    fn volatile_headers_are_ignored() {
        let keys = KeyGenerator::default();
        let a = headers(&[("Authorization", "Bearer 1"), ("Accept", "json")]);
        let b = headers(&[
            ("authorization", "Bearer 2"),
            ("X-Request-Id", "77"),
            ("accept", "json"),
        ]);
        assert_eq!(keys.hash_headers(&a), keys.hash_headers(&b));
    }

    #[test]
    fn relevant_headers_change_the_key() {
        let keys = KeyGenerator::default();
        let a = keys.generate_key(Method::Get, "/x", &headers(&[("accept", "json")]), None);
        let b = keys.generate_key(Method::Get, "/x", &headers(&[("accept", "xml")]), None);
        assert_ne!(a, b);
    }

    #[test]
    fn custom_ignore_list() {
        let keys = KeyGenerator::new(["X-Tenant"]);
        let a = keys.hash_headers(&headers(&[("x-tenant", "1")]));
        assert_eq!(a, EMPTY_HEADERS_HASH);
    }

    #[test]
    fn method_is_part_of_the_key() {
        let keys = KeyGenerator::default();
        let empty = BTreeMap::new();
        assert_ne!(
            keys.generate_key(Method::Get, "/x", &empty, None),
            keys.generate_key(Method::Head, "/x", &empty, None)
        );
    }

    #[test]
    fn dedup_gate() {
        assert!(is_deduplicatable(Method::Get));
        assert!(!is_deduplicatable(Method::Post));
    }
}
