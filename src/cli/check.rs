//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了配置检查命令的实现。

use crate::cache::StrategyRegistry;
use crate::cli::CheckArgs;
use crate::config::Config;
use anyhow::{Context, Result};
use serde_json::json;

pub async fn execute(args: &CheckArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Invalid configuration: {}", args.config.display()))?;
    let registry = StrategyRegistry::from_config(&config.cache);
    let strategies = registry.strategies();

    if args.json {
        let strategies: Vec<_> = strategies
            .values()
            .map(|s| {
                json!({
                    "name": s.name,
                    "ttl_ms": s.ttl.as_millis() as u64,
                    "stale_ms": s.stale_tolerance.as_millis() as u64,
                    "warmup": s.warmup_eligible,
                    "tags": s.tags,
                })
            })
            .collect();
        let output = json!({
            "valid": true,
            "cache": {
                "max_capacity": config.cache.max_capacity,
                "strategies": strategies,
            },
            "warmup": {
                "enabled": config.warmup.enabled,
                "timeout_seconds": config.warmup.timeout_seconds,
            },
            "optimizer": {
                "max_batch_size": config.optimizer.max_batch_size,
                "batch_timeout_ms": config.optimizer.batch_timeout_ms,
                "max_retries": config.optimizer.max_retries,
                "retry_delay_ms": config.optimizer.retry_delay_ms,
                "max_retry_delay_ms": config.optimizer.max_retry_delay_ms,
                "base_url": config.optimizer.base_url,
            },
            "realtime": {
                "schema": config.realtime.schema,
                "global_throttle_ms": config.realtime.global_throttle_ms,
                "max_reconnect_attempts": config.realtime.max_reconnect_attempts,
                "buffer_limit": config.realtime.buffer_limit,
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("=== Configuration OK: {} ===\n", args.config.display());

    println!("Cache (max {} entries)", config.cache.max_capacity);
    println!(
        "  {:<16} {:>12} {:>12} {:>8}  tags",
        "strategy", "ttl", "stale", "warmup"
    );
    for s in strategies.values() {
        println!(
            "  {:<16} {:>12} {:>12} {:>8}  {}",
            s.name,
            format!("{:?}", s.ttl),
            format!("{:?}", s.stale_tolerance),
            if s.warmup_eligible { "yes" } else { "no" },
            s.tags.join(",")
        );
    }

    println!(
        "\nWarmup: {} (timeout {}s)",
        if config.warmup.enabled { "enabled" } else { "disabled" },
        config.warmup.timeout_seconds
    );

    let opt = &config.optimizer;
    println!("\nOptimizer:");
    println!("  Batch:   max {} items, {:?} window", opt.max_batch_size, opt.batch_timeout());
    println!(
        "  Retry:   {} retries, {:?} base, {:?} cap",
        opt.max_retries,
        opt.retry_delay(),
        opt.max_retry_delay()
    );
    println!(
        "  Backend: {}",
        opt.base_url.as_deref().unwrap_or("(none configured)")
    );

    let rt = &config.realtime;
    println!("\nRealtime:");
    println!("  Schema:    {}", rt.schema);
    println!("  Throttle:  {:?}", rt.global_throttle());
    println!(
        "  Reconnect: {} attempts, {}ms base, {}ms cap",
        rt.max_reconnect_attempts, rt.reconnect_base_delay_ms, rt.max_reconnect_delay_ms
    );
    println!("  Buffer:    {} payloads", rt.buffer_limit);

    Ok(())
}
