//! tripcache - 出行应用的客户端数据层
//!
//! 提供按策略过期的内存缓存、缓存预热、请求去重与批处理，
//! 以及带节流、重连和广播的实时变更订阅。

#![doc(html_root_url = "https://docs.rs/tripcache/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod optimizer;
pub mod realtime;
pub mod telemetry;

// Re-export commonly used items
pub use cache::{
    CacheAnalytics, CacheStore, CacheStrategy, StrategyRegistry, WarmupJob, WarmupPriority,
    WarmupResult, WarmupScheduler, WarmupStatus,
};
pub use config::Config;
pub use error::{CacheError, RealtimeError, RequestError, Result};
pub use manager::{DataLayer, DataLayerStats};
pub use optimizer::{
    HttpTransport, Method, OptimizerStats, RequestOptimizer, RequestOptions, RequestPriority,
    Transport,
};
pub use realtime::{
    ChangeEvent, ChangeFeed, ChangePayload, ChannelPriority, ChannelState, InMemoryFeed,
    RealtimeSubscription, RealtimeThrottler, SubscriptionConfig,
};

/// tripcache 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
