//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 数据层端到端集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{setup_logging, RecordingTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tripcache::cache::WarmupPriority;
use tripcache::config::Config;
use tripcache::optimizer::{Method, RequestOptions};
use tripcache::realtime::{ChangeEvent, ChangePayload, InMemoryFeed, SubscriptionConfig};
use tripcache::DataLayer;

const CONFIG: &str = r#"
    [cache]
    max_capacity = 1000
    default_ttl_ms = 60000

    [[cache.strategies]]
    name = "trips"
    ttl_ms = 120000
    tags = ["trips"]

    [[cache.strategies]]
    name = "destinations"
    ttl_ms = 600000
    warmup = true

    [realtime]
    global_throttle_ms = 100
"#;

fn data_layer() -> (
    DataLayer<RecordingTransport, InMemoryFeed>,
    Arc<RecordingTransport>,
    Arc<InMemoryFeed>,
) {
    let config = Config::from_toml_str(CONFIG).unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let feed = Arc::new(InMemoryFeed::new());
    let layer = DataLayer::new(config, transport.clone(), feed.clone()).unwrap();
    (layer, transport, feed)
}

/// 第二次读取命中缓存，不再回源
#[tokio::test(start_paused = true)]
async fn test_fetch_cached_hits_after_first_fetch() {
    setup_logging();
    let (layer, transport, _) = data_layer();

    let first: Value = layer
        .fetch_cached("trip:42", "trips", "/trips/42", RequestOptions::new(Method::Get))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1)).await;
    let second: Value = layer
        .fetch_cached("trip:42", "trips", "/trips/42", RequestOptions::new(Method::Get))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.calls(), 1);
    let stats = layer.stats().await;
    assert_eq!(stats.cache.hit_count, 1);
    assert_eq!(stats.optimizer.total_requests, 1);
}

/// 表变更使绑定标签下的缓存失效，下一次读取重新回源
#[tokio::test(start_paused = true)]
async fn test_realtime_change_invalidates_bound_tags() {
    let (layer, transport, feed) = data_layer();
    layer
        .bind_invalidation(SubscriptionConfig::new("trips"), ["trips"])
        .await
        .unwrap();
    sleep(Duration::from_millis(1)).await;

    let _: Value = layer
        .fetch_cached("trip:42", "trips", "/trips/42", RequestOptions::new(Method::Get))
        .await
        .unwrap();
    layer
        .cache()
        .set("weather:lisbon", json!({"temp": 21}), "default")
        .await;
    assert!(layer.cache().contains_key("trip:42").await);

    feed.publish(
        ChangePayload::new(ChangeEvent::Update, "public", "trips")
            .with_new(json!({"id": 42, "status": "cancelled"})),
    )
    .await;
    sleep(Duration::from_millis(150)).await;

    assert!(!layer.cache().contains_key("trip:42").await);
    assert!(layer.cache().contains_key("weather:lisbon").await);

    let _: Value = layer
        .fetch_cached("trip:42", "trips", "/trips/42", RequestOptions::new(Method::Get))
        .await
        .unwrap();
    assert_eq!(transport.calls(), 2);

    layer.shutdown().await;
    assert_eq!(feed.active_subscriptions(), 0);
}

/// 预热任务经请求优化器回源并写入缓存
#[tokio::test(start_paused = true)]
async fn test_warmup_request_populates_cache() {
    let (layer, transport, _) = data_layer();
    layer
        .add_warmup_request(
            "destination:lisbon",
            WarmupPriority::High,
            "destinations",
            "/destinations/lisbon",
            RequestOptions::new(Method::Get),
        )
        .await;

    let result = layer.warmup().warmup_cache(None).await;
    assert_eq!(result.loaded, 1);
    assert!(result.success);
    assert_eq!(transport.calls(), 1);

    let cached: Value = layer
        .fetch_cached(
            "destination:lisbon",
            "destinations",
            "/destinations/lisbon",
            RequestOptions::new(Method::Get),
        )
        .await
        .unwrap();
    assert_eq!(cached["endpoint"], "/destinations/lisbon");
    assert_eq!(transport.calls(), 1);
}
