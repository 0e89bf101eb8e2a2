//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存、请求优化器和实时节流器的错误类型。

use thiserror::Error;

/// 数据层错误类型枚举
///
/// 定义了缓存系统中可能发生的各种错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 数据获取失败（预热任务或回源）
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// 请求优化器错误
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// 实时通道错误
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 缓存操作结果类型别名
///
/// 简化错误处理，所有缓存操作都返回此类型
pub type Result<T> = std::result::Result<T, CacheError>;

/// 传输层请求错误
///
/// 在传输边界上一次性分类：可重试或终止。下游只匹配变体，不再解析错误信息。
/// 实现 `Clone`，以便去重后的所有调用方共享同一个结果。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// 可重试错误（网络错误、超时、5xx、408、429）
    #[error("retriable failure (status {status:?}): {message}")]
    Retriable {
        status: Option<u16>,
        message: String,
    },

    /// 终止错误（其余 4xx、响应解码失败等），不会重试
    #[error("terminal failure (status {status:?}): {message}")]
    Terminal {
        status: Option<u16>,
        message: String,
    },

    /// 重试次数耗尽
    #[error("gave up after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

impl RequestError {
    /// 根据 HTTP 状态码分类错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 408 || status == 429 {
            RequestError::Retriable {
                status: Some(status),
                message,
            }
        } else {
            RequestError::Terminal {
                status: Some(status),
                message,
            }
        }
    }

    /// 无状态码的网络层错误（连接失败、超时），视为可重试
    pub fn network(message: impl Into<String>) -> Self {
        RequestError::Retriable {
            status: None,
            message: message.into(),
        }
    }

    /// 无状态码的终止错误
    pub fn terminal(message: impl Into<String>) -> Self {
        RequestError::Terminal {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, RequestError::Retriable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Retriable { status, .. } | RequestError::Terminal { status, .. } => {
                *status
            }
            RequestError::RetriesExhausted { .. } => None,
        }
    }
}

/// 实时通道错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// 订阅失败
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    /// 广播发送失败
    #[error("broadcast on {channel} failed: {message}")]
    Broadcast { channel: String, message: String },

    /// 负载编码失败
    #[error("payload encoding failed: {0}")]
    Encoding(String),

    /// 节流器已关闭
    #[error("realtime throttler is shut down")]
    Closed,
}
