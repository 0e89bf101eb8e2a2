//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了实时节流模拟命令的实现。

use crate::cli::SimulateArgs;
use crate::config::Config;
use crate::metrics::get_metrics_string;
use crate::realtime::{
    ChangeEvent, ChangePayload, InMemoryFeed, RealtimeThrottler, SubscriptionConfig,
};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub async fn execute(args: &SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Invalid configuration: {}", path.display()))?,
        None => Config::default(),
    };

    let feed = Arc::new(InMemoryFeed::new());
    let throttler = RealtimeThrottler::new(feed.clone(), &config.realtime);

    let mut subscription = SubscriptionConfig::new(&args.table);
    if let Some(ms) = args.throttle_ms {
        subscription = subscription.with_throttle(Duration::from_millis(ms));
    }
    let throttle = args
        .throttle_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.realtime.global_throttle());

    let callbacks = Arc::new(AtomicU64::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    let handle = {
        let callbacks = callbacks.clone();
        let delivered = delivered.clone();
        throttler.subscribe_optimized(subscription, move |batch| {
            callbacks.fetch_add(1, Ordering::Relaxed);
            delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
        })?
    };

    // 等待通道任务完成订阅
    sleep(Duration::from_millis(20)).await;

    let records = args.records.max(1);
    let gap = if args.events > 1 {
        Duration::from_millis(args.window_ms) / args.events
    } else {
        Duration::ZERO
    };
    println!(
        "Publishing {} events over {} records on {}.{} within {}ms (throttle {:?})",
        args.events, records, config.realtime.schema, args.table, args.window_ms, throttle
    );
    for i in 0..args.events {
        let payload = ChangePayload::new(ChangeEvent::Update, &config.realtime.schema, &args.table)
            .with_new(json!({"id": i % records, "revision": i}));
        feed.publish(payload).await;
        if !gap.is_zero() {
            sleep(gap).await;
        }
    }

    sleep(throttle + Duration::from_millis(100)).await;

    println!("\n=== Simulation Result ===");
    println!("Callbacks:          {}", callbacks.load(Ordering::Relaxed));
    println!("Delivered payloads: {}", delivered.load(Ordering::Relaxed));
    for stats in throttler.channel_stats() {
        println!(
            "Channel {:<16} state={:?} events={} flushes={} dropped={} throttle={}ms",
            stats.name,
            stats.state,
            stats.events_received,
            stats.flush_count,
            stats.dropped_events,
            stats.throttle_ms
        );
    }
    println!(
        "\n{}",
        serde_json::to_string_pretty(&throttler.analytics())?
    );

    if args.prometheus {
        println!("\n{}", get_metrics_string());
    }

    handle.close();
    throttler.shutdown().await;
    Ok(())
}
