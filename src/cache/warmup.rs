//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存预热调度器，按优先级执行预热任务并写入缓存。

use super::store::CacheStore;
use super::strategy::WARMUP_STRATEGY;
use crate::config::WarmupConfig;
use crate::error::Result;
use crate::metrics::GLOBAL_METRICS;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// 预热任务优先级，排序时 High 在前
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WarmupPriority {
    High,
    Medium,
    Low,
}

type Fetcher<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V>> + Send>;

/// 预热任务
///
/// 每个任务只执行一次，执行后不会保留
pub struct WarmupJob<V> {
    pub key: String,
    pub priority: WarmupPriority,
    pub strategy: String,
    fetcher: Fetcher<V>,
}

impl<V> WarmupJob<V> {
    pub fn new<F, Fut>(key: impl Into<String>, priority: WarmupPriority, fetcher: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        Self {
            key: key.into(),
            priority,
            strategy: WARMUP_STRATEGY.to_string(),
            fetcher: Box::new(move || Box::pin(fetcher())),
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }
}

impl<V> std::fmt::Debug for WarmupJob<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupJob")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WarmupStatus {
    Pending,
    InProgress { progress: usize, total: usize },
    Completed { loaded: usize, failed: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupResult {
    pub loaded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success: bool,
}

impl WarmupResult {
    pub fn skipped(count: usize) -> Self {
        Self {
            loaded: 0,
            failed: 0,
            skipped: count,
            success: true,
        }
    }

    pub fn failed(loaded: usize, failed: usize) -> Self {
        Self {
            loaded,
            failed,
            skipped: 0,
            success: false,
        }
    }
}

/// 缓存预热调度器
///
/// 同一个键重复入队时，后入队的任务替换先前的任务
pub struct WarmupScheduler<V> {
    store: Arc<CacheStore<V>>,
    config: WarmupConfig,
    queue: Mutex<Vec<WarmupJob<V>>>,
    status: RwLock<WarmupStatus>,
}

impl<V> WarmupScheduler<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, config: WarmupConfig) -> Self {
        Self {
            store,
            config,
            queue: Mutex::new(Vec::new()),
            status: RwLock::new(WarmupStatus::Pending),
        }
    }

    /// 加入预热任务
    pub async fn add_warmup_job(&self, job: WarmupJob<V>) {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|queued| queued.key != job.key);
        if queue.len() != before {
            debug!("warmup job for key={} replaced by newer job", job.key);
        }
        debug!(
            "warmup job queued: key={}, priority={:?}, strategy={}",
            job.key, job.priority, job.strategy
        );
        queue.push(job);
    }

    /// 队列中待执行的任务数
    pub async fn pending_jobs(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn status(&self) -> WarmupStatus {
        self.status.read().await.clone()
    }

    /// 执行预热
    ///
    /// # 参数
    ///
    /// * `keys` - 仅执行这些键对应的任务；为None时执行全部任务。未选中的任务保留在队列中
    ///
    /// # 返回值
    ///
    /// 返回预热结果。单个任务失败只记录日志并跳过，不会中断其余任务
    #[instrument(skip(self), level = "info")]
    pub async fn warmup_cache(&self, keys: Option<&[String]>) -> WarmupResult {
        let jobs = self.take_jobs(keys).await;

        if !self.config.enabled {
            info!("Cache warmup is disabled, skipping {} jobs", jobs.len());
            return WarmupResult::skipped(jobs.len());
        }

        info!("Starting cache warmup: {} jobs", jobs.len());
        let timeout = tokio::time::Duration::from_secs(self.config.timeout_seconds);
        let loaded = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        match tokio::time::timeout(timeout, self.run_jobs(jobs, &loaded, &failed)).await {
            Ok(result) => {
                info!(
                    "Cache warmup completed: loaded={}, failed={}, skipped={}",
                    result.loaded, result.failed, result.skipped
                );
                *self.status.write().await = WarmupStatus::Completed {
                    loaded: result.loaded,
                    failed: result.failed,
                };
                result
            }
            Err(_) => {
                warn!(
                    "Cache warmup timed out after {} seconds",
                    self.config.timeout_seconds
                );
                *self.status.write().await = WarmupStatus::Failed {
                    error: "timeout".to_string(),
                };
                WarmupResult::failed(
                    loaded.load(Ordering::Relaxed),
                    failed.load(Ordering::Relaxed),
                )
            }
        }
    }

    /// 取出待执行任务，按优先级稳定排序
    async fn take_jobs(&self, keys: Option<&[String]>) -> Vec<WarmupJob<V>> {
        let mut queue = self.queue.lock().await;
        let mut jobs: Vec<WarmupJob<V>> = match keys {
            None => std::mem::take(&mut *queue),
            Some(keys) => {
                let (selected, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut *queue)
                    .into_iter()
                    .partition(|job| keys.contains(&job.key));
                *queue = remaining;
                selected
            }
        };
        jobs.sort_by_key(|job| job.priority);
        jobs
    }

    async fn run_jobs(
        &self,
        jobs: Vec<WarmupJob<V>>,
        loaded: &AtomicUsize,
        failed: &AtomicUsize,
    ) -> WarmupResult {
        let total = jobs.len();
        let mut skipped = 0usize;

        for (progress, job) in jobs.into_iter().enumerate() {
            *self.status.write().await = WarmupStatus::InProgress { progress, total };

            let strategy = self.store.strategy_registry().resolve(&job.strategy);
            if !strategy.warmup_eligible {
                warn!(
                    "skip warmup for key={}: strategy {} is not warmup eligible",
                    job.key, strategy.name
                );
                skipped = skipped.saturating_add(1);
                continue;
            }

            let WarmupJob {
                key,
                strategy: strategy_name,
                fetcher,
                ..
            } = job;
            match fetcher().await {
                Ok(value) => {
                    self.store.set(&key, value, &strategy_name).await;
                    loaded.fetch_add(1, Ordering::Relaxed);
                    GLOBAL_METRICS.record_request("warmup", "job", "success");
                }
                Err(e) => {
                    warn!("warmup job for key={} failed: {}", key, e);
                    failed.fetch_add(1, Ordering::Relaxed);
                    GLOBAL_METRICS.record_request("warmup", "job", "failure");
                }
            }
        }

        let failed = failed.load(Ordering::Relaxed);
        WarmupResult {
            loaded: loaded.load(Ordering::Relaxed),
            failed,
            skipped,
            success: failed == 0,
        }
    }
}
