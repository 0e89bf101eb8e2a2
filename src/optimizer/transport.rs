//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求优化器使用的传输层接口及其HTTP实现。
//!
//! 传输层负责在边界上把失败分类为可重试或终止错误，优化器只依据分类决定是否重试。

use crate::config::OptimizerConfig;
use crate::error::{CacheError, RequestError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// 单个传输请求
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
}

/// 传输层接口
///
/// `send_batch` 默认把所有请求体作为一个数组发送到同一端点，并要求响应为等长数组。
/// 支持逐项错误的后端可以覆盖该方法，返回每一项各自的结果
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 发送单个请求
    async fn send(&self, request: &TransportRequest) -> Result<Value, RequestError>;

    /// 发送批量请求
    async fn send_batch(
        &self,
        endpoint: &str,
        method: Method,
        bodies: Vec<Value>,
    ) -> Result<Vec<Result<Value, RequestError>>, RequestError> {
        let expected = bodies.len();
        let request = TransportRequest {
            endpoint: endpoint.to_string(),
            method,
            body: Some(Value::Array(bodies)),
        };
        match self.send(&request).await? {
            Value::Array(items) if items.len() == expected => Ok(items.into_iter().map(Ok).collect()),
            other => Err(RequestError::terminal(format!(
                "batch response for {} {} is not an array of {} items: {}",
                method, endpoint, expected, other
            ))),
        }
    }
}

/// 基于 reqwest 的 HTTP 传输实现
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// 创建HTTP传输
    ///
    /// # 参数
    ///
    /// * `base_url` - 基础地址，端点路径拼接在其后
    /// * `timeout` - 单次请求超时
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// 根据优化器配置创建HTTP传输，需要配置 `base_url`
    pub fn from_config(config: &OptimizerConfig) -> crate::error::Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            CacheError::ConfigError("optimizer.base_url is required for HTTP transport".to_string())
        })?;
        Self::new(base_url, Duration::from_millis(config.request_timeout_ms))
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), level = "debug", fields(endpoint = %request.endpoint, method = %request.method))]
    async fn send(&self, request: &TransportRequest) -> Result<Value, RequestError> {
        let mut url = reqwest::Url::parse(&self.url(&request.endpoint)).map_err(|e| {
            RequestError::terminal(format!("invalid url for {}: {}", request.endpoint, e))
        })?;
        let mut body = request.body.as_ref();
        if let (Method::Get, Some(Value::Object(params))) = (request.method, body) {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in params {
                match value {
                    Value::String(s) => pairs.append_pair(name, s),
                    other => pairs.append_pair(name, &other.to_string()),
                };
            }
            drop(pairs);
            body = None;
        }

        let mut builder = self.client.request(request.method.into(), url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        debug!("HTTP {} {} -> {}", request.method, request.endpoint, status);

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RequestError::from_status(status.as_u16(), text));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| RequestError::terminal(format!("failed to decode response body: {}", e)))
    }
}

/// 在传输边界上对 reqwest 错误分类
fn classify_reqwest_error(e: reqwest::Error) -> RequestError {
    if let Some(status) = e.status() {
        RequestError::from_status(status.as_u16(), e.to_string())
    } else if e.is_timeout() || e.is_connect() || e.is_request() {
        RequestError::network(e.to_string())
    } else {
        RequestError::terminal(e.to_string())
    }
}
