//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 缓存存储集成测试

#[path = "../common/mod.rs"]
mod common;

use common::setup_logging;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tripcache::cache::{CacheStore, CacheStrategy, StrategyRegistry};
use tripcache::config::CacheConfig;

fn store() -> CacheStore<String> {
    let config = CacheConfig {
        default_ttl_ms: 60_000,
        ..Default::default()
    };
    CacheStore::new(1000, Arc::new(StrategyRegistry::from_config(&config)))
}

/// 首次读取回源并缓存，1ms后的第二次读取直接命中
#[tokio::test(start_paused = true)]
async fn test_get_or_set_fetches_once_within_ttl() {
    setup_logging();
    let store = store();
    let fetches = Arc::new(AtomicUsize::new(0));

    let fetch_trip = || {
        let fetches = fetches.clone();
        move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("trip 42: Lisbon".to_string())
        }
    };

    let first = store.get_or_set("trip:42", "default", fetch_trip()).await;
    assert_eq!(first, Ok("trip 42: Lisbon".to_string()));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    let second = store.get_or_set("trip:42", "default", fetch_trip()).await;
    assert_eq!(second, Ok("trip 42: Lisbon".to_string()));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let analytics = store.analytics().await;
    assert_eq!(analytics.hit_count, 1);
    assert_eq!(analytics.miss_count, 1);
}

/// 过期时间点之前可读，到达过期时间点后读取为空
#[tokio::test(start_paused = true)]
async fn test_ttl_boundary() {
    let store = store();
    store.add_strategy(CacheStrategy::new("minute", Duration::from_secs(60)));
    store
        .set("search:paris", "results".to_string(), "minute")
        .await;

    tokio::time::advance(Duration::from_millis(59_999)).await;
    assert_eq!(
        store.get("search:paris").await,
        Some("results".to_string())
    );

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(store.get("search:paris").await, None);
    assert!(!store.contains_key("search:paris").await);
}

/// 未注册的策略回退到默认策略
#[tokio::test(start_paused = true)]
async fn test_unknown_strategy_uses_default_ttl() {
    let store = store();
    store
        .set("trip:1", "v".to_string(), "no-such-strategy")
        .await;

    tokio::time::advance(Duration::from_millis(59_000)).await;
    assert!(store.contains_key("trip:1").await);
    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(!store.contains_key("trip:1").await);
}

/// 标签失效只移除标签集合有交集的条目
#[tokio::test]
async fn test_invalidate_by_tags_leaves_disjoint_entries() {
    setup_logging();
    let store = store();
    store.add_strategy(
        CacheStrategy::new("bookings", Duration::from_secs(60)).with_tags(["bookings"]),
    );

    store.set("trip:1", "a".to_string(), "default").await;
    store.set("trip:2", "b".to_string(), "default").await;
    store.set("booking:9", "c".to_string(), "bookings").await;
    store
        .set_with_tags("guide:3", "d".to_string(), "default", ["trip:2"])
        .await;
    store.set("weather:lisbon", "e".to_string(), "default").await;

    let removed = store.invalidate_by_tags(["trip"]).await;
    assert_eq!(removed, 2);
    assert!(!store.contains_key("trip:1").await);
    assert!(!store.contains_key("trip:2").await);
    assert!(store.contains_key("booking:9").await);
    assert!(store.contains_key("guide:3").await);

    let removed = store.invalidate_by_tags(["bookings", "trip:2"]).await;
    assert_eq!(removed, 2);
    assert!(!store.contains_key("booking:9").await);
    assert!(!store.contains_key("guide:3").await);
    assert!(store.contains_key("weather:lisbon").await);

    assert_eq!(store.invalidate_by_tags(Vec::<String>::new()).await, 0);
}

#[tokio::test]
async fn test_delete_and_clear() {
    let store = store();
    store.set("trip:1", "a".to_string(), "default").await;
    store.set("trip:2", "b".to_string(), "default").await;

    store.delete("trip:1").await;
    assert_eq!(store.get("trip:1").await, None);
    assert_eq!(store.get("trip:2").await, Some("b".to_string()));

    store.clear();
    assert_eq!(store.get("trip:2").await, None);
}

/// 回源失败不写入缓存，下一次读取重新回源
#[tokio::test]
async fn test_failed_fetch_retried_on_next_read() {
    let store = store();
    let attempts = AtomicUsize::new(0);

    let result = store
        .get_or_set("trip:5", "default", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>("upstream unavailable")
        })
        .await;
    assert_eq!(result, Err("upstream unavailable"));

    let result = store
        .get_or_set("trip:5", "default", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>("ok".to_string())
        })
        .await;
    assert_eq!(result, Ok("ok".to_string()));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
