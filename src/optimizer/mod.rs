//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求优化器，为出站请求提供去重、批处理和重试。
//!
//! 三者的组合顺序为：去重包裹执行，执行时选择批处理或带重试的单次发送。

pub mod batch;
pub mod retry;
pub mod transport;

pub use batch::{BatchConfig, BatchConfigUpdate};
pub use retry::{calculate_retry_delay, RetryPolicy};
pub use transport::{HttpTransport, Method, Transport, TransportRequest};

use crate::config::OptimizerConfig;
use crate::error::RequestError;
use crate::metrics::GLOBAL_METRICS;
use batch::{deliver, BatchItem, BatchKey, FlushSchedule, PendingBatch, SliceResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, instrument, warn};

/// 请求优先级，High 优先级的请求不参与批处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// 单次请求的选项
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: Method,
    pub data: Option<Value>,
    pub priority: RequestPriority,
    pub deduplicate: bool,
    /// 去重键，为None时由方法、端点和请求体推导
    pub dedupe_key: Option<String>,
    pub batch: bool,
    pub retry: bool,
    /// 覆盖配置中的最大重试次数
    pub max_retries: Option<u32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            data: None,
            priority: RequestPriority::Normal,
            deduplicate: true,
            dedupe_key: None,
            batch: false,
            retry: true,
            max_retries: None,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn without_dedupe(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    /// 参与同端点批处理
    ///
    /// 批次按打开时的配置统一重试，所以同时设置了 `without_retry` 或
    /// `with_max_retries` 的请求不进入批次，按单次请求发送
    pub fn batched(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 优化器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    pub active_requests: usize,
    pub batched_count: u64,
    pub deduped_count: u64,
    pub retried_count: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub pending_batches: usize,
}

type SharedResponse = Shared<BoxFuture<'static, Result<Value, RequestError>>>;

struct InFlight {
    id: u64,
    future: SharedResponse,
}

struct Inner<T> {
    transport: Arc<T>,
    config: RwLock<BatchConfig>,
    in_flight: DashMap<String, InFlight>,
    batches: DashMap<BatchKey, PendingBatch>,
    active: AtomicUsize,
    batched: AtomicU64,
    deduped: AtomicU64,
    retried: AtomicU64,
    total: AtomicU64,
    failed: AtomicU64,
    next_id: AtomicU64,
}

/// 活跃请求计数守卫，离开作用域时递减
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 请求优化器
///
/// 克隆得到的实例共享同一组去重表、批次和计数器
pub struct RequestOptimizer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestOptimizer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> RequestOptimizer<T> {
    pub fn new(transport: Arc<T>, config: &OptimizerConfig) -> Self {
        Self::with_batch_config(transport, BatchConfig::from(config))
    }

    pub fn with_batch_config(transport: Arc<T>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config: RwLock::new(config),
                in_flight: DashMap::new(),
                batches: DashMap::new(),
                active: AtomicUsize::new(0),
                batched: AtomicU64::new(0),
                deduped: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                total: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// 发送经过优化的请求
    ///
    /// # 参数
    ///
    /// * `endpoint` - 请求端点
    /// * `options` - 请求选项
    ///
    /// # 返回值
    ///
    /// 返回反序列化后的响应；共享同一去重键的并发调用得到相同结果
    #[instrument(skip(self, options), level = "debug", fields(method = %options.method))]
    pub async fn optimized_request<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<R, RequestError> {
        self.inner.total.fetch_add(1, Ordering::Relaxed);

        let value = if options.deduplicate {
            let key = options
                .dedupe_key
                .clone()
                .unwrap_or_else(|| default_dedupe_key(endpoint, options.method, options.data.as_ref()));
            self.deduplicated(key, endpoint, options).await?
        } else {
            self.execute(endpoint.to_string(), options).await?
        };

        serde_json::from_value(value).map_err(|e| {
            RequestError::terminal(format!("failed to decode response from {}: {}", endpoint, e))
        })
    }

    pub async fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            active_requests: self.inner.active.load(Ordering::Relaxed),
            batched_count: self.inner.batched.load(Ordering::Relaxed),
            deduped_count: self.inner.deduped.load(Ordering::Relaxed),
            retried_count: self.inner.retried.load(Ordering::Relaxed),
            total_requests: self.inner.total.load(Ordering::Relaxed),
            failed_requests: self.inner.failed.load(Ordering::Relaxed),
            pending_batches: self.inner.batches.len(),
        }
    }

    pub async fn batch_config(&self) -> BatchConfig {
        self.inner.config.read().await.clone()
    }

    /// 更新批处理配置，只影响之后打开的批次
    pub async fn update_batch_config(&self, update: BatchConfigUpdate) {
        let mut config = self.inner.config.write().await;
        config.apply(&update);
        debug!("batch config updated: {:?}", *config);
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 在去重表中注册或附加到进行中的请求
    ///
    /// 注册和查找在同一个 entry 操作内完成；实际请求在独立任务中运行，
    /// 调用方放弃等待不会中断它
    async fn deduplicated(
        &self,
        key: String,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let future = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.inner.deduped.fetch_add(1, Ordering::Relaxed);
                debug!("request {} attached to in-flight call", key);
                entry.get().future.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id();
                let this = self.clone();
                let endpoint = endpoint.to_string();
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let result = this.execute(endpoint, options).await;
                    this.inner.in_flight.remove_if(&task_key, |_, f| f.id == id);
                    result
                });
                let future = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RequestError::terminal(format!("request task failed: {}", e)))
                    })
                }
                .boxed()
                .shared();
                entry.insert(InFlight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };
        future.await
    }

    async fn execute(&self, endpoint: String, options: RequestOptions) -> Result<Value, RequestError> {
        let _active = ActiveGuard::new(&self.inner.active);
        let start = std::time::Instant::now();

        let batched = options.batch
            && options.priority != RequestPriority::High
            && options.retry
            && options.max_retries.is_none();
        let result = if batched {
            let body = options.data.unwrap_or(Value::Null);
            self.enqueue_batch(&endpoint, options.method, body).await
        } else {
            self.send_with_retry(&endpoint, &options).await
        };

        let op = if batched { "batch" } else { "send" };
        GLOBAL_METRICS.record_duration("optimizer", op, start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => GLOBAL_METRICS.record_request("optimizer", op, "success"),
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                GLOBAL_METRICS.record_request("optimizer", op, "failure");
                debug!("request to {} failed: {}", endpoint, e);
            }
        }
        result
    }

    async fn send_with_retry(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Value, RequestError> {
        let policy = if options.retry {
            let mut policy = self.inner.config.read().await.retry_policy();
            if let Some(max_retries) = options.max_retries {
                policy.max_retries = max_retries;
            }
            policy
        } else {
            RetryPolicy::none()
        };

        let request = TransportRequest {
            endpoint: endpoint.to_string(),
            method: options.method,
            body: options.data.clone(),
        };
        let transport = &self.inner.transport;
        let request = &request;
        let retried = &self.inner.retried;
        let label = format!("{} {}", options.method, endpoint);

        policy
            .run(
                &label,
                move || transport.send(request),
                |_| {
                    retried.fetch_add(1, Ordering::Relaxed);
                },
            )
            .await
    }

    /// 将请求体加入批次并等待该位置的结果
    async fn enqueue_batch(
        &self,
        endpoint: &str,
        method: Method,
        body: Value,
    ) -> Result<Value, RequestError> {
        let config = self.inner.config.read().await.clone();
        let key: BatchKey = (endpoint.to_string(), method);
        let (reply, rx) = oneshot::channel::<SliceResult>();

        let metric_key = format!("{} {}", method, endpoint);
        let schedule = {
            let mut batch = self
                .inner
                .batches
                .entry(key.clone())
                .or_insert_with(|| PendingBatch::open(self.next_id(), &config));
            batch.items.push(BatchItem { body, reply });
            GLOBAL_METRICS.set_batch_buffer_size(&metric_key, batch.items.len());
            if batch.is_full() {
                Some(FlushSchedule::Now(batch.id))
            } else if batch.items.len() == 1 {
                Some(FlushSchedule::After(batch.id, batch.timeout))
            } else {
                None
            }
        };

        if let Some(schedule) = schedule {
            let this = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                match schedule {
                    FlushSchedule::Now(id) => this.flush_batch(key, id).await,
                    FlushSchedule::After(id, timeout) => {
                        tokio::time::sleep(timeout).await;
                        this.flush_batch(key, id).await
                    }
                }
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(RequestError::terminal(format!(
                "batch for {} {} dropped before completion",
                key.1, key.0
            )))
        })
    }

    /// 刷新指定批次；批次已被其他刷新取走时不做任何事
    async fn flush_batch(&self, key: BatchKey, id: u64) {
        let Some((_, batch)) = self.inner.batches.remove_if(&key, |_, b| b.id == id) else {
            return;
        };
        let (endpoint, method) = key;
        let size = batch.items.len();
        self.inner.batched.fetch_add(size as u64, Ordering::Relaxed);
        GLOBAL_METRICS.clear_batch_buffer_size(&format!("{} {}", method, endpoint));
        debug!("flushing batch {} for {} {}: {} items", id, method, endpoint, size);

        let (bodies, replies): (Vec<Value>, Vec<_>) = batch
            .items
            .into_iter()
            .map(|item| (item.body, item.reply))
            .unzip();

        let transport = &self.inner.transport;
        let retried = &self.inner.retried;
        let endpoint_ref = endpoint.as_str();
        let bodies_ref = &bodies;
        let label = format!("batch {} {}", method, endpoint);
        let result = batch
            .retry
            .run(
                &label,
                move || transport.send_batch(endpoint_ref, method, bodies_ref.clone()),
                |_| {
                    retried.fetch_add(1, Ordering::Relaxed);
                },
            )
            .await;

        if let Err(e) = &result {
            warn!("batch {} for {} {} failed: {}", id, method, endpoint, e);
        }
        deliver(replies, result);
    }
}

/// 默认去重键：方法、端点和请求体哈希
pub fn default_dedupe_key(endpoint: &str, method: Method, data: Option<&Value>) -> String {
    let body = data.map(Value::to_string).unwrap_or_default();
    let hash = murmur3::murmur3_x64_128(&mut body.as_bytes(), 0).unwrap_or(0);
    format!("{} {}#{:032x}", method, endpoint, hash)
}
