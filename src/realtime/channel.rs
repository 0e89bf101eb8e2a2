//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了实时通道的状态机和节流刷新任务。
//!
//! 每个通道由一个后台任务驱动：订阅变更源、缓冲事件、按节流间隔合并后投递给订阅者，
//! 连接出错时按指数退避重连，超过重连上限后进入 `Failed` 状态。

use super::coalesce::coalesce;
use super::feed::{ChangeFeed, ChangePayload, ChannelTopic, FeedEvent};
use crate::config::RealtimeConfig;
use crate::metrics::GLOBAL_METRICS;
use crate::optimizer::calculate_retry_delay;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 通道优先级，决定未显式指定节流时的节流倍数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ChannelPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl ChannelPriority {
    /// 按优先级缩放全局节流间隔：High ×½，Medium ×1，Low ×2
    pub fn scale(&self, global: Duration) -> Duration {
        match self {
            ChannelPriority::High => global / 2,
            ChannelPriority::Medium => global,
            ChannelPriority::Low => global.saturating_mul(2),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ChannelPriority::High => 0,
            ChannelPriority::Medium => 1,
            ChannelPriority::Low => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelPriority::High,
            2 => ChannelPriority::Low,
            _ => ChannelPriority::Medium,
        }
    }
}

/// 通道状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Disconnected,
    Subscribing,
    Subscribed,
    Reconnecting { attempt: u32 },
    Failed { attempts: u32, reason: String },
}

impl ChannelState {
    /// 指标中的健康值（0: 失败或断开, 1: 健康, 2: 连接中）
    pub fn health_code(&self) -> u8 {
        match self {
            ChannelState::Subscribed => 1,
            ChannelState::Subscribing | ChannelState::Reconnecting { .. } => 2,
            ChannelState::Disconnected | ChannelState::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelState::Failed { .. })
    }
}

/// 订阅回调，接收一次刷新中合并后的负载
pub type ChangeCallback = Arc<dyn Fn(Vec<ChangePayload>) + Send + Sync>;

pub(crate) struct Subscriber {
    /// 订阅时使用的通道名
    pub alias: String,
    pub callback: ChangeCallback,
    pub throttle: Option<Duration>,
}

/// 所有通道共享的运行参数
pub(crate) struct ChannelSettings {
    global_throttle_ms: AtomicU64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub buffer_limit: usize,
}

impl ChannelSettings {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            global_throttle_ms: AtomicU64::new(config.global_throttle_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            buffer_limit: config.buffer_limit.max(1),
        }
    }

    pub fn global_throttle(&self) -> Duration {
        Duration::from_millis(self.global_throttle_ms.load(Ordering::Relaxed))
    }

    pub fn set_global_throttle(&self, throttle: Duration) {
        let millis = u64::try_from(throttle.as_millis()).unwrap_or(u64::MAX);
        self.global_throttle_ms.store(millis, Ordering::Relaxed);
    }
}

/// 单个通道的统计信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub topic: String,
    pub state: ChannelState,
    pub priority: ChannelPriority,
    pub subscribers: usize,
    pub events_received: u64,
    pub flush_count: u64,
    pub delivered_payloads: u64,
    pub dropped_events: u64,
    pub reconnect_count: u64,
    pub throttle_ms: u64,
}

/// 实时通道
///
/// 多个订阅者共享同一个通道；最后一个订阅者释放时取消通道任务
pub(crate) struct Channel {
    pub name: String,
    pub topic: ChannelTopic,
    pub subscribers: DashMap<u64, Subscriber>,
    priority: AtomicU8,
    state: watch::Sender<ChannelState>,
    pub cancel: CancellationToken,
    reset: Notify,
    events_received: AtomicU64,
    flush_count: AtomicU64,
    delivered_payloads: AtomicU64,
    dropped_events: AtomicU64,
    reconnect_count: AtomicU64,
}

impl Channel {
    pub fn new(
        name: String,
        topic: ChannelTopic,
        priority: ChannelPriority,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Arc::new(Self {
            name,
            topic,
            subscribers: DashMap::new(),
            priority: AtomicU8::new(priority.to_u8()),
            state,
            cancel,
            reset: Notify::new(),
            events_received: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            delivered_payloads: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn priority(&self) -> ChannelPriority {
        ChannelPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: ChannelPriority) {
        self.priority.store(priority.to_u8(), Ordering::Relaxed);
    }

    /// 重新启用处于 `Failed` 状态的通道
    pub fn reset(&self) -> bool {
        if self.state().is_failed() {
            self.reset.notify_one();
            true
        } else {
            false
        }
    }

    /// 通道的有效节流间隔
    ///
    /// 每个订阅者取显式节流值，否则取按通道优先级缩放的全局节流；通道使用其中最大者
    pub fn effective_throttle(&self, settings: &ChannelSettings) -> Duration {
        let scaled = self.priority().scale(settings.global_throttle());
        self.subscribers
            .iter()
            .map(|s| s.throttle.unwrap_or(scaled))
            .max()
            .unwrap_or(scaled)
    }

    pub fn stats(&self, settings: &ChannelSettings) -> ChannelStats {
        ChannelStats {
            name: self.name.clone(),
            topic: self.topic.to_string(),
            state: self.state(),
            priority: self.priority(),
            subscribers: self.subscribers.len(),
            events_received: self.events_received.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            delivered_payloads: self.delivered_payloads.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            throttle_ms: u64::try_from(self.effective_throttle(settings).as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    fn set_state(&self, state: ChannelState) {
        debug!("channel {} -> {:?}", self.name, state);
        GLOBAL_METRICS.set_channel_health(&self.name, state.health_code());
        self.state.send_replace(state);
    }

    /// 通道主循环，直到被取消
    pub async fn run<F: ChangeFeed>(self: Arc<Self>, feed: Arc<F>, settings: Arc<ChannelSettings>) {
        let mut attempt: u32 = 0;
        let mut rx: Option<mpsc::Receiver<FeedEvent>> = None;
        let mut stream_id: Option<u64> = None;
        let mut retry_at: Option<Instant> = None;
        let mut failed = false;
        let mut buffer: Vec<ChangePayload> = Vec::new();
        let mut flush_at: Option<Instant> = None;

        loop {
            if rx.is_none() && retry_at.is_none() && !failed {
                self.set_state(if attempt == 0 {
                    ChannelState::Subscribing
                } else {
                    ChannelState::Reconnecting { attempt }
                });
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    result = feed.subscribe(&self.topic) => result,
                };
                match result {
                    Ok(stream) => {
                        info!(
                            "channel {} subscribed to {} (stream {})",
                            self.name, self.topic, stream.id
                        );
                        stream_id = Some(stream.id);
                        rx = Some(stream.events);
                        self.set_state(ChannelState::Subscribed);
                    }
                    Err(e) => {
                        retry_at = self.schedule_reconnect(&mut attempt, e.to_string(), &settings);
                        failed = retry_at.is_none();
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    flush_at = None;
                    self.flush(&mut buffer);
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                }
                _ = self.reset.notified(), if failed => {
                    info!("channel {} re-armed after failure", self.name);
                    failed = false;
                    attempt = 0;
                }
                event = recv(&mut rx), if rx.is_some() => match event {
                    Some(FeedEvent::Change(payload)) => {
                        if attempt > 0 {
                            debug!("channel {} delivering again, reconnect counter reset", self.name);
                            attempt = 0;
                        }
                        self.events_received.fetch_add(1, Ordering::Relaxed);
                        buffer.push(payload);
                        self.enforce_buffer_limit(&mut buffer, settings.buffer_limit);
                        if flush_at.is_none() {
                            flush_at = Some(Instant::now() + self.effective_throttle(&settings));
                        }
                    }
                    Some(FeedEvent::Error(reason)) => {
                        rx = None;
                        if let Some(id) = stream_id.take() {
                            feed.unsubscribe(id).await;
                        }
                        retry_at = self.schedule_reconnect(&mut attempt, reason, &settings);
                        failed = retry_at.is_none();
                    }
                    None => {
                        rx = None;
                        stream_id = None;
                        retry_at = self.schedule_reconnect(&mut attempt, "feed closed".to_string(), &settings);
                        failed = retry_at.is_none();
                    }
                },
            }
        }

        if !buffer.is_empty() {
            debug!(
                "channel {} closing with {} undelivered events",
                self.name,
                buffer.len()
            );
        }
        if let Some(id) = stream_id.take() {
            feed.unsubscribe(id).await;
        }
        self.set_state(ChannelState::Disconnected);
        GLOBAL_METRICS.clear_channel_health(&self.name);
        info!("channel {} closed", self.name);
    }

    /// 安排下一次重连；超过上限时进入 `Failed` 并返回None
    fn schedule_reconnect(
        &self,
        attempt: &mut u32,
        reason: String,
        settings: &ChannelSettings,
    ) -> Option<Instant> {
        if *attempt >= settings.max_reconnect_attempts {
            warn!(
                "channel {} failed after {} reconnect attempts: {}",
                self.name, *attempt, reason
            );
            GLOBAL_METRICS.record_request("realtime", "reconnect", "exhausted");
            self.set_state(ChannelState::Failed {
                attempts: *attempt,
                reason,
            });
            return None;
        }

        let delay = calculate_retry_delay(
            *attempt,
            settings.reconnect_base_delay,
            settings.max_reconnect_delay,
        );
        *attempt += 1;
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        GLOBAL_METRICS.record_request("realtime", "reconnect", "scheduled");
        warn!(
            "channel {} error: {}; reconnect attempt {}/{} in {:?}",
            self.name, reason, *attempt, settings.max_reconnect_attempts, delay
        );
        self.set_state(ChannelState::Reconnecting { attempt: *attempt });
        Some(Instant::now() + delay)
    }

    /// 缓冲区超过上限时先合并，仍超出则丢弃最旧的负载
    fn enforce_buffer_limit(&self, buffer: &mut Vec<ChangePayload>, limit: usize) {
        if buffer.len() <= limit {
            return;
        }
        *buffer = coalesce(std::mem::take(buffer));
        if buffer.len() > limit {
            let excess = buffer.len() - limit;
            buffer.drain(..excess);
            self.dropped_events.fetch_add(excess as u64, Ordering::Relaxed);
            warn!("channel {} buffer full, dropped {} events", self.name, excess);
        }
    }

    fn flush(&self, buffer: &mut Vec<ChangePayload>) {
        let batch = coalesce(std::mem::take(buffer));
        if batch.is_empty() {
            return;
        }
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.delivered_payloads
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        GLOBAL_METRICS.record_request("realtime", "flush", "success");

        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .iter()
            .map(|s| s.callback.clone())
            .collect();
        debug!(
            "channel {} flushing {} payloads to {} subscribers",
            self.name,
            batch.len(),
            callbacks.len()
        );
        for callback in callbacks {
            callback(batch.clone());
        }
    }
}

async fn recv(rx: &mut Option<mpsc::Receiver<FeedEvent>>) -> Option<FeedEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
