//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 指数退避重试策略

use crate::error::RequestError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 计算重试延迟的工具函数 (指数退避，带上限)
///
/// `delay = base * 2^attempt`，不超过 `max_delay`
pub fn calculate_retry_delay(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base_delay.saturating_mul(factor).min(max_delay)
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_retry_delay(attempt, self.base_delay, self.max_delay)
    }

    /// 执行操作，对可重试错误按退避策略重试
    ///
    /// 总尝试次数最多为 `1 + max_retries`；终止错误立即返回。
    /// 重试耗尽后返回 `RequestError::RetriesExhausted`
    pub async fn run<T, F, Fut, R>(&self, label: &str, mut op: F, on_retry: R) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
        R: Fn(u32),
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    on_retry(attempt + 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retriable() && self.max_retries > 0 => {
                    warn!("{} failed after {} attempts: {}", label, attempt + 1, e);
                    return Err(RequestError::RetriesExhausted {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
