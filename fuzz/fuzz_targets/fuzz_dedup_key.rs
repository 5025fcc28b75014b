//! Fuzz target for dedup key derivation.
//!
//! Keys must be deterministic for any url, header set and body.

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use dispatch_core::dedup::{normalize_url, KeyGenerator};
use dispatch_core::request::Method;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    path: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

fuzz_target!(|input: Input| {
    let keys = KeyGenerator::default();
    let headers: BTreeMap<String, String> = input.headers.into_iter().collect();
    let body = input.body.map(serde_json::Value::String);

    let key = keys.generate_key(Method::Get, &input.path, &headers, body.as_ref());
    let again = keys.generate_key(Method::Get, &input.path, &headers, body.as_ref());
    assert_eq!(key, again);

    let _ = normalize_url(&input.path);
});
