//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了数据层管理器，负责按配置组装缓存、预热、请求优化器和实时节流器。

use crate::cache::{
    CacheAnalytics, CacheStore, StrategyRegistry, WarmupJob, WarmupPriority, WarmupScheduler,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::optimizer::{OptimizerStats, RequestOptimizer, RequestOptions, Transport};
use crate::realtime::{
    ChangeFeed, RealtimeAnalytics, RealtimeSubscription, RealtimeThrottler, SubscriptionConfig,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// 数据层各组件的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct DataLayerStats {
    pub cache: CacheAnalytics,
    pub optimizer: OptimizerStats,
    pub realtime: RealtimeAnalytics,
}

/// 数据层管理器
///
/// 缓存未命中时通过请求优化器回源并按策略写入缓存；实时变更可绑定到标签失效
pub struct DataLayer<T, F> {
    config: Config,
    cache: Arc<CacheStore<Value>>,
    warmup: WarmupScheduler<Value>,
    optimizer: RequestOptimizer<T>,
    realtime: RealtimeThrottler<F>,
    bindings: Mutex<Vec<RealtimeSubscription>>,
}

impl<T: Transport, F: ChangeFeed> DataLayer<T, F> {
    /// 创建数据层
    ///
    /// # 参数
    ///
    /// * `config` - 数据层配置
    /// * `transport` - 请求优化器使用的传输层
    /// * `feed` - 实时节流器使用的变更订阅源
    ///
    /// # 返回值
    ///
    /// 配置校验失败时返回 `CacheError::ConfigError`
    #[instrument(skip_all, level = "info")]
    pub fn new(config: Config, transport: Arc<T>, feed: Arc<F>) -> Result<Self> {
        config.validate().map_err(CacheError::ConfigError)?;

        let strategies = Arc::new(StrategyRegistry::from_config(&config.cache));
        let cache = Arc::new(CacheStore::new(config.cache.max_capacity, strategies));
        let warmup = WarmupScheduler::new(cache.clone(), config.warmup.clone());
        let optimizer = RequestOptimizer::new(transport, &config.optimizer);
        let realtime = RealtimeThrottler::new(feed, &config.realtime);

        info!(
            "data layer initialized: capacity={}, strategies={}",
            config.cache.max_capacity,
            cache.strategies().len()
        );
        Ok(Self {
            config,
            cache,
            warmup,
            optimizer,
            realtime,
            bindings: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore<Value>> {
        &self.cache
    }

    pub fn warmup(&self) -> &WarmupScheduler<Value> {
        &self.warmup
    }

    pub fn optimizer(&self) -> &RequestOptimizer<T> {
        &self.optimizer
    }

    pub fn realtime(&self) -> &RealtimeThrottler<F> {
        &self.realtime
    }

    /// 读取缓存，未命中时经请求优化器回源并按策略缓存
    ///
    /// 回源失败时不缓存任何内容
    #[instrument(skip(self, options), level = "debug")]
    pub async fn fetch_cached<R: DeserializeOwned>(
        &self,
        key: &str,
        strategy: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<R> {
        let value = self
            .cache
            .get_or_set(key, strategy, || {
                self.optimizer
                    .optimized_request::<Value>(endpoint, options)
            })
            .await?;
        serde_json::from_value(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// 注册一个经请求优化器回源的预热任务
    pub async fn add_warmup_request(
        &self,
        key: &str,
        priority: WarmupPriority,
        strategy: &str,
        endpoint: &str,
        options: RequestOptions,
    ) {
        let optimizer = self.optimizer.clone();
        let endpoint = endpoint.to_string();
        let job = WarmupJob::new(key, priority, move || async move {
            optimizer
                .optimized_request::<Value>(&endpoint, options)
                .await
                .map_err(CacheError::from)
        })
        .with_strategy(strategy);
        self.warmup.add_warmup_job(job).await;
    }

    /// 将实时变更绑定到缓存标签失效
    ///
    /// 通道每次刷新时失效给定标签下的所有条目；绑定在 `shutdown` 时释放
    pub async fn bind_invalidation<I, S>(&self, config: SubscriptionConfig, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Arc<Vec<String>> = Arc::new(tags.into_iter().map(Into::into).collect());
        let cache = self.cache.clone();
        let table = config.table.clone();
        let callback_tags = tags.clone();
        let subscription = self.realtime.subscribe_optimized(config, move |batch| {
            let cache = cache.clone();
            let tags = callback_tags.clone();
            debug!("{} changes received, invalidating tags {:?}", batch.len(), tags);
            tokio::spawn(async move {
                cache.invalidate_by_tags(tags.iter()).await;
            });
        })?;
        info!("table {} bound to cache tags {:?}", table, tags);
        self.bindings.lock().await.push(subscription);
        Ok(())
    }

    pub async fn stats(&self) -> DataLayerStats {
        DataLayerStats {
            cache: self.cache.analytics().await,
            optimizer: self.optimizer.stats().await,
            realtime: self.realtime.analytics(),
        }
    }

    /// 关闭数据层：释放失效绑定并关闭实时节流器
    pub async fn shutdown(&self) {
        info!("shutting down data layer");
        for subscription in self.bindings.lock().await.drain(..) {
            subscription.close();
        }
        self.realtime.shutdown().await;
    }
}
