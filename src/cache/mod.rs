//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存存储、缓存策略注册表和预热调度器。

pub mod store;
pub mod strategy;
pub mod warmup;

pub use store::{CacheAnalytics, CacheEntry, CacheStore};
pub use strategy::{CacheStrategy, StrategyRegistry, DEFAULT_STRATEGY, WARMUP_STRATEGY};
pub use warmup::{WarmupJob, WarmupPriority, WarmupResult, WarmupScheduler, WarmupStatus};
