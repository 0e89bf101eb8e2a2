//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了数据层的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// 数据层配置
///
/// 每个分区都有默认值，配置文件中可以只写需要覆盖的部分
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub config_version: Option<u32>,
    pub cache: CacheConfig,
    pub warmup: WarmupConfig,
    pub optimizer: OptimizerConfig,
    pub realtime: RealtimeConfig,
}

/// 缓存配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    /// 最大条目数
    pub max_capacity: u64,
    /// `default` 策略的过期时间（毫秒）
    pub default_ttl_ms: u64,
    /// 额外注册的缓存策略
    pub strategies: Vec<StrategyConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            default_ttl_ms: 5 * 60 * 1000,
            strategies: Vec::new(),
        }
    }
}

/// 缓存策略配置
#[derive(Deserialize, Clone, Debug)]
pub struct StrategyConfig {
    pub name: String,
    pub ttl_ms: u64,
    /// 过期后仍可通过 `get_stale` 读取的时长（毫秒）
    #[serde(default)]
    pub stale_ms: u64,
    /// 是否允许预热
    #[serde(default)]
    pub warmup: bool,
    /// 该策略下写入的条目附带的标签
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 缓存预热配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WarmupConfig {
    /// 是否启用预热
    pub enabled: bool,
    /// 单次预热的超时时间（秒）
    pub timeout_seconds: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 300,
        }
    }
}

/// 请求优化器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct OptimizerConfig {
    /// 单个批次的最大请求数
    pub max_batch_size: usize,
    /// 批次等待窗口（毫秒）
    pub batch_timeout_ms: u64,
    /// 默认最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 重试延迟上限（毫秒）
    pub max_retry_delay_ms: u64,
    /// HTTP 传输的基础地址
    pub base_url: Option<String>,
    /// HTTP 请求超时（毫秒）
    pub request_timeout_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_timeout_ms: 50,
            max_retries: 2,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 10_000,
            base_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl OptimizerConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

/// 实时节流器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 默认数据库 schema
    pub schema: String,
    /// 全局节流间隔（毫秒），订阅未指定节流时使用
    pub global_throttle_ms: u64,
    /// 最大重连次数
    pub max_reconnect_attempts: u32,
    /// 重连基础延迟（毫秒）
    pub reconnect_base_delay_ms: u64,
    /// 重连延迟上限（毫秒）
    pub max_reconnect_delay_ms: u64,
    /// 单个通道缓冲的最大负载数，超出后先合并，仍超出时丢弃最旧的负载
    pub buffer_limit: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            global_throttle_ms: 100,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            buffer_limit: 1000,
        }
    }
}

impl RealtimeConfig {
    pub fn global_throttle(&self) -> Duration {
        Duration::from_millis(self.global_throttle_ms)
    }
}

impl Config {
    /// 从 TOML 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析配置并验证
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CacheError::ConfigError(e.to_string()))?;
        config.validate().map_err(CacheError::ConfigError)?;
        Ok(config)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有值都在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        if self.cache.max_capacity == 0 {
            return Err("cache max_capacity cannot be zero".to_string());
        }
        if self.cache.max_capacity > 10_000_000 {
            return Err("cache max_capacity cannot exceed 10,000,000".to_string());
        }
        if self.cache.default_ttl_ms > 86_400_000 * 30 {
            return Err("cache default_ttl_ms cannot exceed 30 days".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for strategy in &self.cache.strategies {
            if strategy.name.is_empty() {
                return Err("Strategy name cannot be empty".to_string());
            }
            if strategy.name.len() > 64 {
                return Err(format!(
                    "Strategy name '{}' exceeds maximum length of 64 characters",
                    strategy.name
                ));
            }
            if !seen.insert(strategy.name.as_str()) {
                return Err(format!("Strategy '{}' is declared twice", strategy.name));
            }
            if strategy.ttl_ms > 86_400_000 * 30 {
                return Err(format!(
                    "Strategy '{}' ttl_ms cannot exceed 30 days",
                    strategy.name
                ));
            }
        }

        if self.warmup.enabled
            && (self.warmup.timeout_seconds == 0 || self.warmup.timeout_seconds > 3600)
        {
            return Err("warmup timeout_seconds must be between 1 and 3600".to_string());
        }

        let opt = &self.optimizer;
        if opt.max_batch_size == 0 || opt.max_batch_size > 1000 {
            return Err("optimizer max_batch_size must be between 1 and 1000".to_string());
        }
        if opt.batch_timeout_ms > 60_000 {
            return Err("optimizer batch_timeout_ms cannot exceed 60000 ms".to_string());
        }
        if opt.max_retries > 10 {
            return Err("optimizer max_retries cannot exceed 10".to_string());
        }
        if opt.retry_delay_ms > opt.max_retry_delay_ms {
            return Err(format!(
                "optimizer retry_delay_ms ({}) must be <= max_retry_delay_ms ({})",
                opt.retry_delay_ms, opt.max_retry_delay_ms
            ));
        }
        if !(100..=300_000).contains(&opt.request_timeout_ms) {
            return Err("optimizer request_timeout_ms must be between 100 and 300000 ms".to_string());
        }

        let rt = &self.realtime;
        if rt.schema.is_empty() {
            return Err("realtime schema cannot be empty".to_string());
        }
        if rt.global_throttle_ms > 60_000 {
            return Err("realtime global_throttle_ms cannot exceed 60000 ms".to_string());
        }
        if rt.max_reconnect_attempts > 20 {
            return Err("realtime max_reconnect_attempts cannot exceed 20".to_string());
        }
        if rt.reconnect_base_delay_ms > rt.max_reconnect_delay_ms {
            return Err(format!(
                "realtime reconnect_base_delay_ms ({}) must be <= max_reconnect_delay_ms ({})",
                rt.reconnect_base_delay_ms, rt.max_reconnect_delay_ms
            ));
        }
        if rt.buffer_limit == 0 {
            return Err("realtime buffer_limit cannot be zero".to_string());
        }

        Ok(())
    }
}
