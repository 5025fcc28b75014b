//! End-to-end tests through the assembled pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_core::api::{BatchOptions, BatchPayload};
use dispatch_core::batch::{Executor, FnExecutor, Instrumented};
use dispatch_core::error::CoreError;
use dispatch_core::request::{ExecutionOutput, Method, RequestSpec, WorkItem};
use dispatch_core::shutdown::DrainResult;
use dispatch_core::{Pipeline, PipelineConfig};
use parking_lot::Mutex;
use serde_json::json;

/// Buffering long enough that only explicit flushes dispatch.
fn manual_flush_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.batcher.batch_timeout = Duration::from_secs(10);
    config.batcher.max_wait_time = Duration::from_secs(20);
    config
}

fn counting_executor(calls: Arc<AtomicUsize>) -> Arc<dyn Executor> {
    Arc::new(Instrumented::new(FnExecutor::new(move |item: WorkItem| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionOutput::ok(json!({ "method": item.method.as_str(), "url": item.url })))
        }
    })))
}

#[tokio::test]
async fn reordered_query_gets_coalesce_and_post_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let first = pipeline.submit(RequestSpec::new("GET", "/x?b=2&a=1").with_id("g1")).unwrap();
    let second = pipeline.submit(RequestSpec::new("GET", "/x?a=1&b=2").with_id("g2")).unwrap();
    let post = pipeline
        .submit(RequestSpec::new("POST", "/x").with_id("p1").with_body(json!({ "v": 1 })))
        .unwrap();
    pipeline.flush().await;

    let responses = [first.await.unwrap(), second.await.unwrap(), post.await.unwrap()];
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(responses.iter().filter(|r| r.deduplicated).count(), 1);
    assert!(responses.iter().all(|r| r.is_success()));
    assert_eq!(responses[0].id, "g1");
    assert_eq!(responses[1].id, "g2");
    assert_eq!(responses[2].data.as_ref().unwrap()["method"], "POST");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn submit_then_flush_round_trips_generated_id() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(manual_flush_config(), counting_executor(calls)).unwrap();

    let handle = pipeline.submit(RequestSpec::new("GET", "/ping")).unwrap();
    let id = handle.id().to_string();
    assert!(id.starts_with("req_"));
    assert_eq!(pipeline.status().pending_responses, 1);

    pipeline.flush().await;
    let response = handle.await.unwrap();
    assert_eq!(response.id, id);
    assert_eq!(pipeline.status().pending_responses, 0);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn debounce_timer_dispatches_without_flush() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(PipelineConfig::default(), executor).unwrap();

    let response = pipeline
        .add_request(RequestSpec::new("GET", "/timer").with_id("t1"))
        .await
        .unwrap();
    assert_eq!(response.id, "t1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn payload_is_chunked_and_answered_in_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let requests = (0..5)
        .map(|n| RequestSpec::new("GET", format!("/items/{n}")).with_id(format!("r{n}")))
        .collect();
    let payload = BatchPayload::new(requests).with_options(BatchOptions {
        max_batch_size: Some(2),
        ..Default::default()
    });

    let result = pipeline.process_payload(payload).await.unwrap();
    let ids: Vec<_> = result.responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["r0", "r1", "r2", "r3", "r4"]);
    assert_eq!(result.metadata.total_requests, 5);
    assert_eq!(pipeline.processor().stats().batches_processed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    pipeline.shutdown().await;
}

fn recording_executor(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn Executor> {
    Arc::new(FnExecutor::new(move |item: WorkItem| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(item.id.clone());
            Ok(ExecutionOutput::ok(json!({ "id": item.id })))
        }
    }))
}

fn post(id: &str, client: &str, priority: u32) -> RequestSpec {
    RequestSpec::new("POST", format!("/{id}"))
        .with_id(id)
        .with_client(client)
        .with_priority(priority)
}

#[tokio::test]
async fn sequential_batch_runs_in_priority_order_across_clients() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut config = manual_flush_config();
    config.batch.parallel_execution = false;
    let pipeline = Pipeline::new(config, recording_executor(Arc::clone(&seen))).unwrap();

    let handles = [
        pipeline.submit(post("b1", "b", 10)).unwrap(),
        pipeline.submit(post("a1", "a", 1)).unwrap(),
        pipeline.submit(post("a2", "a", 1)).unwrap(),
        pipeline.submit(post("a3", "a", 1)).unwrap(),
    ];
    pipeline.flush().await;
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert_eq!(*seen.lock(), ["a1", "a2", "a3", "b1"]);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn chunked_payload_from_one_client_is_admitted_whole() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let requests = (0..4).map(|n| post(&format!("r{n}"), "acme", 5)).collect();
    let payload = BatchPayload::new(requests).with_options(BatchOptions {
        max_batch_size: Some(2),
        ..Default::default()
    });
    let result = pipeline.process_payload(payload).await.unwrap();

    assert!(result.responses.iter().all(|r| r.is_success()), "{:?}", result.responses);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(pipeline.scheduler().stats().fairness_rejections, 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn batch_larger_than_client_limit_rejects_only_the_overflow() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = manual_flush_config();
    config.scheduler.fairness.max_concurrent_per_client = 2;
    let pipeline = Pipeline::new(config, counting_executor(Arc::clone(&calls))).unwrap();

    let handles = [
        pipeline.submit(post("c1", "acme", 1)).unwrap(),
        pipeline.submit(post("c2", "acme", 2)).unwrap(),
        pipeline.submit(post("c3", "acme", 3)).unwrap(),
    ];
    pipeline.flush().await;
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }

    assert!(responses[0].is_success());
    assert!(responses[1].is_success());
    let error = responses[2].error.as_ref().unwrap();
    assert_eq!(error.code, "SCHEDULING_REJECTED");
    assert_eq!(error.details.as_ref().unwrap()["reason"], "fairness_denied");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn status_counts_only_directly_scheduled_work() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    pipeline
        .scheduler()
        .schedule_request(WorkItem::new("direct", Method::Get, "/direct"))
        .unwrap();
    let payload = BatchPayload::new(vec![RequestSpec::new("GET", "/batched")]);
    pipeline.process_payload(payload).await.unwrap();

    assert_eq!(pipeline.status().queued_requests, 1);
    assert_eq!(pipeline.scheduler().get_next_request().unwrap().id, "direct");
    assert_eq!(pipeline.status().queued_requests, 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_rejected_before_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let payload = BatchPayload::new(vec![
        RequestSpec::new("GET", "/a").with_id("dup"),
        RequestSpec::new("GET", "/b").with_id("dup"),
    ]);
    let err = pipeline.process_payload(payload).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    let too_many = BatchPayload::new((0..101).map(|_| RequestSpec::new("GET", "/a")).collect());
    assert!(pipeline.process_payload(too_many).await.is_err());

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn payload_options_can_disable_dedup() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let payload = BatchPayload::new(vec![
        RequestSpec::new("GET", "/same"),
        RequestSpec::new("GET", "/same"),
    ])
    .with_options(BatchOptions {
        enable_deduplication: Some(false),
        ..Default::default()
    });
    let result = pipeline.process_payload(payload).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.responses.iter().all(|r| !r.deduplicated));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_answers_buffered_requests_and_refuses_new_ones() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = counting_executor(Arc::clone(&calls));
    let pipeline = Pipeline::new(manual_flush_config(), executor).unwrap();

    let buffered = pipeline.submit(RequestSpec::new("GET", "/late")).unwrap();
    assert_eq!(pipeline.shutdown().await, DrainResult::Complete);
    assert!(buffered.await.unwrap().is_success());

    let err = pipeline.submit(RequestSpec::new("GET", "/after")).unwrap_err();
    assert!(matches!(err, CoreError::Shutdown));
    let err = pipeline
        .process_payload(BatchPayload::new(vec![RequestSpec::new("GET", "/after")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Shutdown));
    assert!(!pipeline.status().batching_enabled);
}

#[tokio::test]
async fn invalid_config_is_refused() {
    let mut config = PipelineConfig::default();
    config.batcher.max_batch_size = 0;
    let calls = Arc::new(AtomicUsize::new(0));
    assert!(Pipeline::new(config, counting_executor(calls)).is_err());
}
