//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 缓存预热集成测试

#[path = "../common/mod.rs"]
mod common;

use common::setup_logging;
use std::sync::Arc;
use std::time::Duration;
use tripcache::cache::{
    CacheStore, CacheStrategy, WarmupJob, WarmupPriority, WarmupScheduler, WarmupStatus,
};
use tripcache::config::WarmupConfig;

fn store() -> Arc<CacheStore<String>> {
    let store = CacheStore::with_capacity(100);
    store.add_strategy(
        CacheStrategy::new("destinations", Duration::from_secs(600)).warmup_eligible(),
    );
    Arc::new(store)
}

fn job(key: &str, value: &str, priority: WarmupPriority) -> WarmupJob<String> {
    let value = value.to_string();
    WarmupJob::new(key, priority, move || async move { Ok(value) }).with_strategy("destinations")
}

/// 同一个键重复入队时只保留最后一次
#[tokio::test]
async fn test_duplicate_key_last_enqueued_wins() {
    setup_logging();
    let store = store();
    let scheduler = WarmupScheduler::new(store.clone(), WarmupConfig::default());

    scheduler
        .add_warmup_job(job("destination:lisbon", "old", WarmupPriority::Low))
        .await;
    scheduler
        .add_warmup_job(job("destination:lisbon", "new", WarmupPriority::High))
        .await;
    assert_eq!(scheduler.pending_jobs().await, 1);

    let result = scheduler.warmup_cache(None).await;
    assert_eq!(result.loaded, 1);
    assert_eq!(
        store.get("destination:lisbon").await,
        Some("new".to_string())
    );
}

/// 只执行选中的键，其余任务保留到下一次预热
#[tokio::test]
async fn test_selected_keys_leave_rest_queued() {
    let store = store();
    let scheduler = WarmupScheduler::new(store.clone(), WarmupConfig::default());
    scheduler
        .add_warmup_job(job("destination:paris", "paris", WarmupPriority::Medium))
        .await;
    scheduler
        .add_warmup_job(job("destination:rome", "rome", WarmupPriority::Medium))
        .await;

    let result = scheduler
        .warmup_cache(Some(&["destination:rome".to_string()]))
        .await;
    assert_eq!(result.loaded, 1);
    assert!(store.contains_key("destination:rome").await);
    assert!(!store.contains_key("destination:paris").await);
    assert_eq!(scheduler.pending_jobs().await, 1);

    let result = scheduler.warmup_cache(None).await;
    assert_eq!(result.loaded, 1);
    assert!(store.contains_key("destination:paris").await);
}

/// 不允许预热的策略被跳过
#[tokio::test]
async fn test_ineligible_strategy_is_skipped() {
    let store = store();
    let scheduler = WarmupScheduler::new(store.clone(), WarmupConfig::default());
    scheduler
        .add_warmup_job(
            WarmupJob::new("trip:1", WarmupPriority::High, || async {
                Ok("trip".to_string())
            })
            .with_strategy("default"),
        )
        .await;
    scheduler
        .add_warmup_job(job("destination:oslo", "oslo", WarmupPriority::Low))
        .await;

    let result = scheduler.warmup_cache(None).await;
    assert_eq!(result.loaded, 1);
    assert_eq!(result.skipped, 1);
    assert!(result.success);
    assert!(!store.contains_key("trip:1").await);
}

/// 超时后整体预热失败，已完成的条目保留
#[tokio::test(start_paused = true)]
async fn test_warmup_timeout_reports_failure() {
    let store = store();
    let scheduler = WarmupScheduler::new(
        store.clone(),
        WarmupConfig {
            enabled: true,
            timeout_seconds: 1,
        },
    );
    scheduler
        .add_warmup_job(job("destination:fast", "fast", WarmupPriority::High))
        .await;
    scheduler
        .add_warmup_job(
            WarmupJob::new("destination:slow", WarmupPriority::Low, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("slow".to_string())
            })
            .with_strategy("destinations"),
        )
        .await;

    let result = scheduler.warmup_cache(None).await;
    assert!(!result.success);
    assert_eq!(result.loaded, 1);
    assert!(store.contains_key("destination:fast").await);
    assert!(!store.contains_key("destination:slow").await);
    assert_eq!(
        scheduler.status().await,
        WarmupStatus::Failed {
            error: "timeout".to_string()
        }
    );
}
