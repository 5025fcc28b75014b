//! Tests for request deduplication: key derivation and in-flight coalescing.

use std::collections::BTreeMap;
use std::time::Duration;

use dispatch_core::dedup::{
    is_deduplicatable, normalize_url, DedupConfig, DeduplicationCache, KeyGenerator, Lookup,
};
use dispatch_core::error::CoreError;
use dispatch_core::request::{BatchedResponse, ExecutionOutput, Method};
use serde_json::json;

fn ok_response(id: &str) -> BatchedResponse {
    BatchedResponse::from_output(id, ExecutionOutput::ok(json!({ "from": id })), Duration::ZERO)
}

fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_key_ignores_query_order() {
    let keys = KeyGenerator::default();
    let a = keys.generate_key(Method::Get, "/users?b=2&a=1", &BTreeMap::new(), None);
    let b = keys.generate_key(Method::Get, "/users?a=1&b=2", &BTreeMap::new(), None);
    assert_eq!(a, b);
}

#[test]
fn test_key_ignores_volatile_headers() {
    let keys = KeyGenerator::default();
    let a = keys.generate_key(
        Method::Get,
        "/users",
        &headers(&[("Authorization", "Bearer one"), ("X-Request-Id", "1")]),
        None,
    );
    let b = keys.generate_key(
        Method::Get,
        "/users",
        &headers(&[("authorization", "Bearer two"), ("x-request-id", "2")]),
        None,
    );
    assert_eq!(a, b);
}

#[test]
fn test_key_differs_by_relevant_parts() {
    let keys = KeyGenerator::default();
    let base = keys.generate_key(Method::Get, "/users", &BTreeMap::new(), None);

    let other_path = keys.generate_key(Method::Get, "/orders", &BTreeMap::new(), None);
    let csv = headers(&[("Accept", "text/csv")]);
    let with_header = keys.generate_key(Method::Get, "/users", &csv, None);
    let body = json!({"q": 1});
    let with_body = keys.generate_key(Method::Get, "/users", &BTreeMap::new(), Some(&body));
    let head = keys.generate_key(Method::Head, "/users", &BTreeMap::new(), None);

    for other in [other_path, with_header, with_body, head] {
        assert_ne!(base, other);
    }
}

#[test]
fn test_custom_ignore_list() {
    let keys = KeyGenerator::new(["X-Tenant"]);
    let a = keys.generate_key(Method::Get, "/a", &headers(&[("x-tenant", "1")]), None);
    let b = keys.generate_key(Method::Get, "/a", &headers(&[("x-tenant", "2")]), None);
    assert_eq!(a, b);

    // Not in the custom list any more.
    let c = keys.generate_key(Method::Get, "/a", &headers(&[("authorization", "x")]), None);
    assert_ne!(a, c);
}

#[test]
fn test_absolute_urls_keep_origin() {
    assert_ne!(
        normalize_url("https://a.example/users"),
        normalize_url("https://b.example/users")
    );
    assert_eq!(normalize_url("/users?z=1&a=2"), "/users?a=2&z=1");
}

#[test]
fn test_only_idempotent_methods_deduplicate() {
    assert!(is_deduplicatable(Method::Get));
    assert!(is_deduplicatable(Method::Head));
    assert!(is_deduplicatable(Method::Options));
    assert!(!is_deduplicatable(Method::Post));
    assert!(!is_deduplicatable(Method::Put));
    assert!(!is_deduplicatable(Method::Delete));
}

#[tokio::test]
async fn test_concurrent_callers_share_one_execution() {
    let cache = DeduplicationCache::new(DedupConfig::default());

    let Lookup::Execute(ticket) = cache.begin("k", "r1", None) else {
        panic!("first caller must execute");
    };
    let Lookup::Pending(w2) = cache.begin("k", "r2", Some("client-b")) else {
        panic!("second caller must wait");
    };
    let Lookup::Pending(w3) = cache.begin("k", "r3", None) else {
        panic!("third caller must wait");
    };
    assert_eq!(cache.pending_count(), 2);

    assert_eq!(ticket.complete(ok_response("r1")), 2);
    let (a, b) = tokio::join!(w2.wait(), w3.wait());
    assert_eq!(a.unwrap().data, Some(json!({ "from": "r1" })));
    assert_eq!(b.unwrap().data, Some(json!({ "from": "r1" })));

    // Later callers read the cache.
    assert!(matches!(cache.begin("k", "r4", None), Lookup::Cached(_)));
    let stats = cache.stats();
    assert_eq!(stats.coalesced, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_error_responses_reach_waiters_but_are_not_cached() {
    let cache = DeduplicationCache::new(DedupConfig::default());
    let Lookup::Execute(ticket) = cache.begin("k", "r1", None) else {
        panic!("expected execute");
    };
    let Lookup::Pending(waiter) = cache.begin("k", "r2", None) else {
        panic!("expected pending");
    };

    let failed = ok_response("r1");
    let failed = BatchedResponse {
        status: 500,
        ..failed
    };
    ticket.complete(failed);
    assert_eq!(waiter.wait().await.unwrap().status, 500);
    assert!(cache.is_empty());
    assert!(matches!(cache.begin("k", "r3", None), Lookup::Execute(_)));
}

#[tokio::test]
async fn test_abandoned_ticket_fails_waiters() {
    let cache = DeduplicationCache::new(DedupConfig::default());
    let Lookup::Execute(ticket) = cache.begin("k", "r1", None) else {
        panic!("expected execute");
    };
    let Lookup::Pending(waiter) = cache.begin("k", "r2", None) else {
        panic!("expected pending");
    };
    drop(ticket);
    let err = waiter.wait().await.unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ABANDONED");
}

#[tokio::test(start_paused = true)]
async fn test_waiter_times_out_independently() {
    let cache = DeduplicationCache::new(DedupConfig {
        max_pending_time: Duration::from_millis(100),
        ..Default::default()
    });
    let Lookup::Execute(ticket) = cache.begin("k", "r1", None) else {
        panic!("expected execute");
    };
    let Lookup::Pending(early) = cache.begin("k", "r2", None) else {
        panic!("expected pending");
    };

    let err = early.wait().await.unwrap_err();
    assert!(matches!(err, CoreError::DeduplicationTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(cache.stats().timeouts, 1);

    // A waiter registered after the timeout still gets the response.
    let Lookup::Pending(late) = cache.begin("k", "r3", None) else {
        panic!("expected pending");
    };
    ticket.complete(ok_response("r1"));
    assert!(late.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_entries_expire_after_max_age() {
    let cache = DeduplicationCache::new(DedupConfig {
        max_age: Duration::from_secs(1),
        ..Default::default()
    });
    cache.set_response("k", ok_response("r1"));
    assert!(cache.has_response("k"));

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert!(!cache.has_response("k"));
    let report = cache.sweep();
    assert_eq!(report.expired_entries, 1);
    assert!(cache.is_empty());
}

#[test]
fn test_lru_eviction_keeps_recent_entries() {
    let cache = DeduplicationCache::new(DedupConfig {
        max_cache_size: 2,
        ..Default::default()
    });
    cache.set_response("a", ok_response("a"));
    cache.set_response("b", ok_response("b"));
    assert!(cache.get_response("a").is_some());
    cache.set_response("c", ok_response("c"));

    assert!(cache.has_response("a"));
    assert!(!cache.has_response("b"));
    assert!(cache.has_response("c"));
    assert_eq!(cache.stats().evictions, 1);
}
