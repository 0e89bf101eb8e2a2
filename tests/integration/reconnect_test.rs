//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 实时通道重连集成测试

#[path = "../common/mod.rs"]
mod common;

use common::setup_logging;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tripcache::config::RealtimeConfig;
use tripcache::realtime::{
    ChangeEvent, ChangePayload, ChannelState, InMemoryFeed, RealtimeThrottler, SubscriptionConfig,
};

fn config() -> RealtimeConfig {
    RealtimeConfig {
        global_throttle_ms: 50,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 10,
        max_reconnect_delay_ms: 100,
        ..Default::default()
    }
}

/// 持续失败的通道在达到重连上限后进入 Failed，不再重试
#[tokio::test(start_paused = true)]
async fn test_channel_fails_after_max_attempts() {
    setup_logging();
    let feed = Arc::new(InMemoryFeed::new());
    feed.fail_all_subscribes();
    let throttler = RealtimeThrottler::new(feed.clone(), &config());

    let subscription = throttler
        .subscribe_optimized(SubscriptionConfig::new("trips"), |_| {})
        .unwrap();
    let mut state = throttler.watch_channel(subscription.channel()).unwrap();
    state.wait_for(ChannelState::is_failed).await.unwrap();

    assert_eq!(feed.subscribe_calls(), 4);
    assert!(matches!(
        throttler.channel_state(subscription.channel()),
        Some(ChannelState::Failed { attempts: 3, .. })
    ));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(feed.subscribe_calls(), 4);

    let health = throttler.connection_health();
    assert!(!health.healthy);
    assert_eq!(health.failed, vec![subscription.channel().to_string()]);
    let analytics = throttler.analytics();
    assert_eq!(analytics.failed_channels, 1);
    assert_eq!(analytics.reconnect_count, 3);
}

/// 重置后通道重新订阅并恢复
#[tokio::test(start_paused = true)]
async fn test_reset_rearms_failed_channel() {
    let feed = Arc::new(InMemoryFeed::new());
    feed.fail_all_subscribes();
    let throttler = RealtimeThrottler::new(feed.clone(), &config());

    let subscription = throttler
        .subscribe_optimized(SubscriptionConfig::new("trips"), |_| {})
        .unwrap();
    let mut state = throttler.watch_channel(subscription.channel()).unwrap();
    state.wait_for(ChannelState::is_failed).await.unwrap();

    feed.fail_next_subscribes(0);
    assert!(throttler.reset_channel(subscription.channel()));
    state
        .wait_for(|s| *s == ChannelState::Subscribed)
        .await
        .unwrap();
    assert_eq!(feed.subscribe_calls(), 5);
    assert!(throttler.connection_health().healthy);

    assert!(!throttler.reset_channel(subscription.channel()));
    assert!(!throttler.reset_channel("missing"));
}

/// 连接错误后通道自动重连并继续投递
#[tokio::test(start_paused = true)]
async fn test_transient_error_reconnects_and_resumes_delivery() {
    let feed = Arc::new(InMemoryFeed::new());
    let throttler = RealtimeThrottler::new(feed.clone(), &config());
    let delivered = Arc::new(AtomicUsize::new(0));

    let sink = delivered.clone();
    let subscription = throttler
        .subscribe_optimized(SubscriptionConfig::new("bookings"), move |batch| {
            sink.fetch_add(batch.len(), Ordering::SeqCst);
        })
        .unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(
        throttler.channel_state(subscription.channel()),
        Some(ChannelState::Subscribed)
    );

    assert_eq!(feed.inject_error("bookings", "socket closed").await, 1);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        throttler.channel_state(subscription.channel()),
        Some(ChannelState::Subscribed)
    );
    assert_eq!(feed.subscribe_calls(), 2);
    assert_eq!(throttler.channel_stats()[0].reconnect_count, 1);

    feed.publish(
        ChangePayload::new(ChangeEvent::Insert, "public", "bookings").with_new(json!({"id": 1})),
    )
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

/// 关闭后所有通道退订
#[tokio::test(start_paused = true)]
async fn test_shutdown_unsubscribes_every_channel() {
    let feed = Arc::new(InMemoryFeed::new());
    let throttler = RealtimeThrottler::new(feed.clone(), &config());

    let trips = throttler
        .subscribe_optimized(SubscriptionConfig::new("trips"), |_| {})
        .unwrap();
    let _guides = throttler
        .subscribe_optimized(SubscriptionConfig::new("guides"), |_| {})
        .unwrap();
    let mut state = throttler.watch_channel(trips.channel()).unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(feed.active_subscriptions(), 2);

    throttler.shutdown().await;
    assert_eq!(*state.borrow_and_update(), ChannelState::Disconnected);
    assert_eq!(feed.active_subscriptions(), 0);
    assert_eq!(feed.unsubscribe_calls(), 2);
    assert!(throttler.channel_stats().is_empty());

    drop(trips);
    assert_eq!(feed.unsubscribe_calls(), 2);
}
