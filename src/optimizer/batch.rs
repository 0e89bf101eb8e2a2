//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求批处理使用的配置和缓冲区结构。

use super::retry::RetryPolicy;
use super::transport::Method;
use crate::config::OptimizerConfig;
use crate::error::RequestError;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// 批处理与重试配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&OptimizerConfig::default())
    }
}

impl From<&OptimizerConfig> for BatchConfig {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            max_retry_delay: config.max_retry_delay(),
        }
    }
}

impl BatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
        }
    }

    /// 应用部分更新，未设置的字段保持不变
    pub fn apply(&mut self, update: &BatchConfigUpdate) {
        if let Some(size) = update.max_batch_size {
            self.max_batch_size = size.max(1);
        }
        if let Some(timeout) = update.batch_timeout {
            self.batch_timeout = timeout;
        }
        if let Some(retries) = update.max_retries {
            self.max_retries = retries;
        }
        if let Some(delay) = update.retry_delay {
            self.retry_delay = delay;
        }
    }
}

/// 批处理配置的部分更新
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchConfigUpdate {
    pub max_batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

/// 批次按端点和方法分组
pub(crate) type BatchKey = (String, Method);

pub(crate) type SliceResult = Result<Value, RequestError>;

pub(crate) struct BatchItem {
    pub body: Value,
    pub reply: oneshot::Sender<SliceResult>,
}

/// 尚未刷新的批次
///
/// 批次在打开时记录当时的大小上限和重试策略，之后的配置更新不影响它
pub(crate) struct PendingBatch {
    pub id: u64,
    pub items: Vec<BatchItem>,
    pub max_size: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl PendingBatch {
    pub fn open(id: u64, config: &BatchConfig) -> Self {
        Self {
            id,
            items: Vec::with_capacity(config.max_batch_size),
            max_size: config.max_batch_size,
            timeout: config.batch_timeout,
            retry: config.retry_policy(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }
}

/// 入队后需要安排的刷新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushSchedule {
    Now(u64),
    After(u64, Duration),
}

/// 将批量调用结果按位置分发给各调用方
///
/// 整体失败时每个调用方都收到同一个错误；响应缺少的位置以终止错误结束
pub(crate) fn deliver(
    replies: Vec<oneshot::Sender<SliceResult>>,
    result: Result<Vec<SliceResult>, RequestError>,
) -> usize {
    let mut failed = 0usize;
    match result {
        Ok(slices) => {
            let mut slices = slices.into_iter();
            for reply in replies {
                let slice = slices.next().unwrap_or_else(|| {
                    Err(RequestError::terminal("batch response missing slice"))
                });
                if slice.is_err() {
                    failed += 1;
                }
                let _ = reply.send(slice);
            }
        }
        Err(e) => {
            for reply in replies {
                failed += 1;
                let _ = reply.send(Err(e.clone()));
            }
        }
    }
    failed
}
