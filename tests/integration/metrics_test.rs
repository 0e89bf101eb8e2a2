//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 指标收集集成测试

#[path = "../common/mod.rs"]
mod common;

use common::RecordingTransport;
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tripcache::cache::CacheStore;
use tripcache::config::{OptimizerConfig, RealtimeConfig};
use tripcache::metrics::{get_metrics_string, GLOBAL_METRICS};
use tripcache::optimizer::{Method, RequestOptimizer, RequestOptions};
use tripcache::realtime::{InMemoryFeed, RealtimeThrottler, SubscriptionConfig};

#[test]
#[serial]
fn test_metrics_recording() {
    GLOBAL_METRICS.record_request("test_component", "get", "hit");
    GLOBAL_METRICS.record_duration("test_component", "get", 0.005);
    GLOBAL_METRICS.set_batch_buffer_size("POST /test", 42);

    let output = get_metrics_string();

    println!("Metrics output:\n{}", output);

    assert!(output.contains(
        "tripcache_requests_total{component=\"test_component\", op=\"get\", result=\"hit\"}"
    ));
    assert!(output.contains(
        "tripcache_operation_duration_seconds_sum{component=\"test_component\", op=\"get\"} 0.005"
    ));
    assert!(output.contains(
        "tripcache_operation_duration_seconds_count{component=\"test_component\", op=\"get\"} 1"
    ));
    assert!(output.contains("tripcache_batch_buffer_size{batch=\"POST /test\"} 42"));
}

#[tokio::test]
#[serial]
async fn test_cache_reads_are_counted() {
    let hits = GLOBAL_METRICS.request_count("cache", "get", "hit");
    let misses = GLOBAL_METRICS.request_count("cache", "get", "miss");

    let store: CacheStore<u32> = CacheStore::with_capacity(10);
    assert_eq!(store.get("trip:1").await, None);
    store.set("trip:1", 1, "default").await;
    assert_eq!(store.get("trip:1").await, Some(1));

    assert_eq!(GLOBAL_METRICS.request_count("cache", "get", "hit"), hits + 1);
    assert_eq!(GLOBAL_METRICS.request_count("cache", "get", "miss"), misses + 1);
}

#[tokio::test]
#[serial]
async fn test_optimizer_outcomes_are_counted() {
    let before = GLOBAL_METRICS.request_count("optimizer", "send", "success");
    let optimizer = RequestOptimizer::new(
        Arc::new(RecordingTransport::new()),
        &OptimizerConfig::default(),
    );
    let _: Value = optimizer
        .optimized_request("/trips", RequestOptions::new(Method::Get))
        .await
        .unwrap();
    assert_eq!(
        GLOBAL_METRICS.request_count("optimizer", "send", "success"),
        before + 1
    );
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_channel_health_follows_state() {
    let feed = Arc::new(InMemoryFeed::new());
    let throttler = RealtimeThrottler::new(feed, &RealtimeConfig::default());
    let subscription = throttler
        .subscribe_optimized(
            SubscriptionConfig::new("trips").with_channel("metrics-health"),
            |_| {},
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
        GLOBAL_METRICS
            .channel_health
            .get("metrics-health")
            .map(|v| *v),
        Some(1)
    );
    assert!(get_metrics_string().contains("tripcache_channel_health{channel=\"metrics-health\"} 1"));

    drop(subscription);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(GLOBAL_METRICS.channel_health.get("metrics-health").is_none());
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_batch_buffer_size_is_tracked_per_endpoint() {
    let optimizer = RequestOptimizer::new(
        Arc::new(RecordingTransport::new()),
        &OptimizerConfig {
            max_batch_size: 10,
            batch_timeout_ms: 50,
            ..Default::default()
        },
    );
    let pending = {
        let optimizer = optimizer.clone();
        tokio::spawn(async move {
            optimizer
                .optimized_request::<Value>(
                    "/metrics-batch",
                    RequestOptions::new(Method::Post)
                        .with_data(json!({"seat": 1}))
                        .batched(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        GLOBAL_METRICS
            .batch_buffer_size
            .get("POST /metrics-batch")
            .map(|v| *v),
        Some(1)
    );
    assert!(get_metrics_string().contains("tripcache_batch_buffer_size{batch=\"POST /metrics-batch\"} 1"));

    assert!(pending.await.unwrap().is_ok());
    assert!(GLOBAL_METRICS
        .batch_buffer_size
        .get("POST /metrics-batch")
        .is_none());
}
