//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了带标签和策略的内存缓存存储，基于Moka实现。

use super::strategy::{CacheStrategy, StrategyRegistry};
use crate::metrics::GLOBAL_METRICS;
use moka::future::Cache;
use moka::ops::compute::Op;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub tags: HashSet<String>,
    pub strategy: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// 超过该时间点后条目在下一次读取或清理时被移除
    pub stale_until: Instant,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn is_past_stale(&self, now: Instant) -> bool {
        now >= self.stale_until
    }

    fn has_any_tag(&self, tags: &HashSet<&str>) -> bool {
        self.tags.iter().any(|t| tags.contains(t.as_str()))
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CacheAnalytics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
    pub eviction_count: u64,
}

/// 内存缓存存储
///
/// 过期条目采用惰性淘汰：读取时与当前时间比较，不依赖后台清理任务。
/// 条目总数由Moka的容量上限约束。
pub struct CacheStore<V> {
    entries: Cache<String, Arc<CacheEntry<V>>>,
    strategies: Arc<StrategyRegistry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// 创建新的缓存存储
    ///
    /// # 参数
    ///
    /// * `capacity` - 最大条目数
    /// * `strategies` - 策略注册表
    pub fn new(capacity: u64, strategies: Arc<StrategyRegistry>) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
            strategies,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// 使用内置策略创建缓存存储
    pub fn with_capacity(capacity: u64) -> Self {
        Self::new(capacity, Arc::new(StrategyRegistry::default()))
    }

    pub fn strategy_registry(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    /// 获取缓存值
    ///
    /// 缺失或已过期时返回None；超过容忍期的条目在此处被移除
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key).await {
            Some(entry) if !entry.is_expired(now) => {
                self.record_hit();
                debug!("cache get: key={}, hit=true", key);
                Some(entry.value.clone())
            }
            Some(entry) => {
                self.record_miss();
                if entry.is_past_stale(now) {
                    self.evict_if(key, |e| e.is_past_stale(now)).await;
                }
                debug!("cache get: key={}, expired=true", key);
                None
            }
            None => {
                self.record_miss();
                debug!("cache get: key={}, hit=false", key);
                None
            }
        }
    }

    /// 读取已过期但仍在容忍期内的值
    ///
    /// 不计入命中率统计
    pub async fn get_stale(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .await
            .filter(|e| !e.is_past_stale(now))
            .map(|e| e.value.clone())
    }

    /// 条目存在且未过期
    pub async fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .await
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// 设置缓存值
    ///
    /// # 参数
    ///
    /// * `key` - 缓存键
    /// * `value` - 缓存值
    /// * `strategy` - 策略名称，未注册时使用 `default`
    pub async fn set(&self, key: &str, value: V, strategy: &str) {
        self.set_with_tags(key, value, strategy, std::iter::empty::<&str>())
            .await
    }

    /// 设置缓存值并附加额外标签
    #[instrument(skip(self, value, extra_tags), level = "debug")]
    pub async fn set_with_tags<I, S>(&self, key: &str, value: V, strategy: &str, extra_tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let strategy = self.strategies.resolve(strategy);
        let tags = derive_tags(key, &strategy, extra_tags);
        let now = Instant::now();
        let expires_at = now + strategy.ttl;
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            tags,
            strategy: strategy.name.clone(),
            created_at: now,
            expires_at,
            stale_until: expires_at + strategy.stale_tolerance,
        };
        debug!(
            "cache set: key={}, strategy={}, ttl={:?}, tags={:?}",
            key, strategy.name, strategy.ttl, entry.tags
        );
        self.entries.insert(key.to_string(), Arc::new(entry)).await;
        GLOBAL_METRICS.record_request("cache", "set", "success");
    }

    /// 获取缓存值，未命中时调用 `fetcher` 并写入缓存
    ///
    /// 本层不合并并发请求；`fetcher` 失败时原样返回其错误，且不缓存任何内容
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, strategy: &str, fetcher: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let start = std::time::Instant::now();
        let result = fetcher().await;
        GLOBAL_METRICS.record_duration("cache", "fetch", start.elapsed().as_secs_f64());

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                GLOBAL_METRICS.record_request("cache", "fetch", "failure");
                debug!("cache get_or_set: key={}, fetch failed, nothing cached", key);
                return Err(e);
            }
        };
        self.set(key, value.clone(), strategy).await;
        Ok(value)
    }

    /// 删除缓存项
    pub async fn delete(&self, key: &str) {
        debug!("cache delete: key={}", key);
        self.entries.invalidate(key).await;
    }

    /// 按标签批量失效
    ///
    /// 移除所有标签集合与给定标签有交集的条目，返回移除数量
    #[instrument(skip(self, tags), level = "debug")]
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let owned: Vec<S> = tags.into_iter().collect();
        let wanted: HashSet<&str> = owned.iter().map(|t| t.as_ref()).collect();
        if wanted.is_empty() {
            return 0;
        }

        let candidates: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.has_any_tag(&wanted))
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self.remove_if(&key, |e| e.has_any_tag(&wanted)).await {
                removed += 1;
            }
        }
        debug!("invalidated {} entries for tags {:?}", removed, wanted);
        GLOBAL_METRICS.record_request("cache", "invalidate_tags", "success");
        removed
    }

    /// 清理超过容忍期的过期条目，返回清理数量
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_past_stale(now))
            .map(|(key, _)| key)
            .collect();

        let mut purged = 0;
        for key in expired {
            if self.evict_if(&key, |e| e.is_past_stale(now)).await {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("purged {} expired entries", purged);
        }
        purged
    }

    /// 清空缓存
    pub fn clear(&self) {
        debug!("cache clear");
        self.entries.invalidate_all();
    }

    /// 注册或替换策略
    pub fn add_strategy(&self, strategy: CacheStrategy) {
        self.strategies.add_strategy(strategy);
    }

    /// 所有已注册策略
    pub fn strategies(&self) -> BTreeMap<String, CacheStrategy> {
        self.strategies.strategies()
    }

    /// 获取缓存统计
    pub async fn analytics(&self) -> CacheAnalytics {
        self.entries.run_pending_tasks().await;
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheAnalytics {
            hit_count,
            miss_count,
            hit_rate: if total > 0 {
                hit_count as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.entries.entry_count(),
            eviction_count: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        GLOBAL_METRICS.record_request("cache", "get", "hit");
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        GLOBAL_METRICS.record_request("cache", "get", "miss");
    }

    async fn evict_if<P>(&self, key: &str, pred: P) -> bool
    where
        P: FnOnce(&CacheEntry<V>) -> bool,
    {
        let evicted = self.remove_if(key, pred).await;
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// 仅当当前条目仍满足条件时移除，避免误删并发写入的新值
    async fn remove_if<P>(&self, key: &str, pred: P) -> bool
    where
        P: FnOnce(&CacheEntry<V>) -> bool,
    {
        let mut removed = false;
        self.entries
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if pred(entry.value()) => {
                        removed = true;
                        Op::Remove
                    }
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        removed
    }
}

/// 计算条目标签：策略标签 + 键命名空间 + 额外标签
fn derive_tags<I, S>(key: &str, strategy: &CacheStrategy, extra: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tags: HashSet<String> = strategy.tags.iter().cloned().collect();
    if let Some((namespace, _)) = key.split_once(':') {
        if !namespace.is_empty() {
            tags.insert(namespace.to_string());
        }
    }
    tags.extend(extra.into_iter().map(Into::into));
    tags
}
