//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了数据层的指标收集和监控功能。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use tracing::{span, Level};

/// 指标收集器
///
/// 用于收集和存储缓存、请求优化器和实时通道的运行时指标
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 请求总数统计
    /// key: "component:op:result"
    pub requests_total: Arc<DashMap<String, u64>>,
    /// 通道健康状态（0: 失败, 1: 健康, 2: 重连中）
    pub channel_health: Arc<DashMap<String, u8>>,
    /// 操作耗时，key: "component:op" -> (total_duration_secs, count)
    pub operation_duration: Arc<DashMap<String, (f64, u64)>>,
    /// 待发送批次中的请求数，key: "METHOD endpoint"，批次发送后移除
    pub batch_buffer_size: Arc<DashMap<String, usize>>,
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

impl Metrics {
    /// 记录请求指标
    ///
    /// # 参数
    ///
    /// * `component` - 组件名称（cache/optimizer/realtime/warmup）
    /// * `op` - 操作类型
    /// * `result` - 操作结果（hit/miss/success/failure/...）
    pub fn record_request(&self, component: &str, op: &str, result: &str) {
        let span = span!(Level::TRACE, "record_request", component, op, result);
        let _enter = span.enter();
        let key = format!("{}:{}:{}", component, op, result);
        *self.requests_total.entry(key).or_insert(0) += 1;
    }

    /// 记录操作耗时
    pub fn record_duration(&self, component: &str, op: &str, duration_secs: f64) {
        let key = format!("{}:{}", component, op);
        let mut entry = self.operation_duration.entry(key).or_insert((0.0, 0));
        entry.0 += duration_secs;
        entry.1 += 1;
    }

    /// 设置通道健康状态
    pub fn set_channel_health(&self, channel: &str, status: u8) {
        self.channel_health.insert(channel.to_string(), status);
    }

    /// 移除通道健康状态（通道关闭时）
    pub fn clear_channel_health(&self, channel: &str) {
        self.channel_health.remove(channel);
    }

    /// 设置批次缓冲区大小
    pub fn set_batch_buffer_size(&self, batch: &str, size: usize) {
        self.batch_buffer_size.insert(batch.to_string(), size);
    }

    /// 移除批次缓冲区大小（批次发送时）
    pub fn clear_batch_buffer_size(&self, batch: &str) {
        self.batch_buffer_size.remove(batch);
    }

    /// 读取某个计数器的当前值
    pub fn request_count(&self, component: &str, op: &str, result: &str) -> u64 {
        let key = format!("{}:{}:{}", component, op, result);
        self.requests_total.get(&key).map(|v| *v).unwrap_or(0)
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为 Prometheus 文本格式
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;
    let mut output = String::new();

    for entry in metrics.requests_total.iter() {
        let parts: Vec<&str> = entry.key().split(':').collect();
        if parts.len() == 3 {
            output.push_str(&format!(
                "tripcache_requests_total{{component=\"{}\", op=\"{}\", result=\"{}\"}} {}\n",
                parts[0],
                parts[1],
                parts[2],
                entry.value()
            ));
        }
    }
    for entry in metrics.channel_health.iter() {
        output.push_str(&format!(
            "tripcache_channel_health{{channel=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.operation_duration.iter() {
        let (total, count) = *entry.value();
        let parts: Vec<&str> = entry.key().split(':').collect();
        if parts.len() == 2 {
            output.push_str(&format!(
                "tripcache_operation_duration_seconds_sum{{component=\"{}\", op=\"{}\"}} {}\n",
                parts[0], parts[1], total
            ));
            output.push_str(&format!(
                "tripcache_operation_duration_seconds_count{{component=\"{}\", op=\"{}\"}} {}\n",
                parts[0], parts[1], count
            ));
        }
    }
    for entry in metrics.batch_buffer_size.iter() {
        output.push_str(&format!(
            "tripcache_batch_buffer_size{{batch=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    output
}
