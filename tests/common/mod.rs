//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use tripcache::error::RequestError;
use tripcache::optimizer::{Method, Transport, TransportRequest};

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new("debug"))
            .try_init()
            .ok();
    });
}

/// 记录调用的传输层测试替身
///
/// 默认回显请求体：`{"endpoint": ..., "body": ...}`；批量请求逐项回显。
/// 可配置固定延迟和持续失败
#[derive(Default)]
pub struct RecordingTransport {
    delay: Duration,
    failure: Mutex<Option<RequestError>>,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    batch_sizes: Mutex<Vec<usize>>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// 之后的每次调用都以该错误失败
    pub fn failing(error: RequestError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// `send` 调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `send_batch` 调用次数
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    async fn attempt(&self) -> Result<(), RequestError> {
        self.call_times.lock().unwrap().push(Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: &TransportRequest) -> Result<Value, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempt().await?;
        Ok(json!({
            "endpoint": request.endpoint,
            "body": request.body.clone().unwrap_or(Value::Null),
        }))
    }

    async fn send_batch(
        &self,
        endpoint: &str,
        _method: Method,
        bodies: Vec<Value>,
    ) -> Result<Vec<Result<Value, RequestError>>, RequestError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(bodies.len());
        self.attempt().await?;
        Ok(bodies
            .into_iter()
            .map(|body| Ok(json!({"endpoint": endpoint, "body": body})))
            .collect())
    }
}
