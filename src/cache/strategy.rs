//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存策略及其注册表。

use crate::config::CacheConfig;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_STRATEGY: &str = "default";

/// 预热任务未指定策略时使用的内置策略
pub const WARMUP_STRATEGY: &str = "warm-critical";

/// 缓存策略
///
/// 决定条目的过期时间、过期后的容忍时长以及是否允许预热
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStrategy {
    pub name: String,
    pub ttl: Duration,
    /// 过期后仍可通过 `get_stale` 读到旧值的时长
    pub stale_tolerance: Duration,
    pub warmup_eligible: bool,
    /// 该策略下写入的每个条目都带有这些标签
    pub tags: Vec<String>,
}

impl CacheStrategy {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            stale_tolerance: Duration::ZERO,
            warmup_eligible: false,
            tags: Vec::new(),
        }
    }

    pub fn with_stale_tolerance(mut self, stale_tolerance: Duration) -> Self {
        self.stale_tolerance = stale_tolerance;
        self
    }

    pub fn warmup_eligible(mut self) -> Self {
        self.warmup_eligible = true;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// 缓存策略注册表
///
/// 查找未注册的策略名称时回退到 `default` 策略
#[derive(Debug)]
pub struct StrategyRegistry {
    strategies: DashMap<String, CacheStrategy>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_default_ttl(Duration::from_secs(5 * 60))
    }
}

impl StrategyRegistry {
    /// 创建带内置策略的注册表
    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        let registry = Self {
            strategies: DashMap::new(),
        };
        registry.add_strategy(CacheStrategy::new(DEFAULT_STRATEGY, default_ttl));
        registry.add_strategy(
            CacheStrategy::new("short-lived", Duration::from_secs(30))
                .with_stale_tolerance(Duration::from_secs(10)),
        );
        registry.add_strategy(
            CacheStrategy::new(WARMUP_STRATEGY, Duration::from_secs(30 * 60))
                .with_stale_tolerance(Duration::from_secs(5 * 60))
                .warmup_eligible(),
        );
        registry.add_strategy(
            CacheStrategy::new("static", Duration::from_secs(24 * 60 * 60)).warmup_eligible(),
        );
        registry
    }

    /// 根据配置创建注册表，配置中的同名策略覆盖内置策略
    pub fn from_config(config: &CacheConfig) -> Self {
        let registry = Self::with_default_ttl(Duration::from_millis(config.default_ttl_ms));
        for s in &config.strategies {
            let mut strategy = CacheStrategy::new(s.name.clone(), Duration::from_millis(s.ttl_ms))
                .with_stale_tolerance(Duration::from_millis(s.stale_ms))
                .with_tags(s.tags.iter().cloned());
            strategy.warmup_eligible = s.warmup;
            registry.add_strategy(strategy);
        }
        registry
    }

    /// 注册或替换策略
    pub fn add_strategy(&self, strategy: CacheStrategy) {
        debug!(
            "register cache strategy: name={}, ttl={:?}",
            strategy.name, strategy.ttl
        );
        self.strategies.insert(strategy.name.clone(), strategy);
    }

    /// 解析策略，未注册时回退到 `default`
    pub fn resolve(&self, name: &str) -> CacheStrategy {
        if let Some(s) = self.strategies.get(name) {
            return s.value().clone();
        }
        debug!("strategy '{}' not registered, falling back to default", name);
        self.strategies
            .get(DEFAULT_STRATEGY)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| CacheStrategy::new(DEFAULT_STRATEGY, Duration::from_secs(5 * 60)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// 所有已注册策略（按名称排序）
    pub fn strategies(&self) -> BTreeMap<String, CacheStrategy> {
        self.strategies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
