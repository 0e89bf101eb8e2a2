//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了实时更新节流器。
//!
//! 节流器为每个 (schema, table, event, filter) 维护一个共享通道，把高频变更合并后
//! 按节流间隔投递给订阅者，并负责应用层广播的优先级发送。通道名只是主题的别名，
//! 同一主题下不同名称的订阅共享同一个通道和变更源订阅。

pub mod broadcast;
pub mod channel;
pub mod coalesce;
pub mod feed;
pub mod memory;

pub use broadcast::{decode_payload, encode_payload, BroadcastOptions, BroadcastPriority};
pub use channel::{ChangeCallback, ChannelPriority, ChannelState, ChannelStats};
pub use coalesce::coalesce;
pub use feed::{
    BroadcastMessage, BroadcastPayload, ChangeEvent, ChangeFeed, ChangePayload, ChannelTopic,
    FeedEvent, FeedStream,
};
pub use memory::InMemoryFeed;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use broadcast::BroadcastQueue;
use channel::{Channel, ChannelSettings, Subscriber};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 订阅配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// 通道名称，为None时使用主题字符串
    pub channel: Option<String>,
    /// 为None时使用节流器配置中的 schema
    pub schema: Option<String>,
    pub table: String,
    pub filter: Option<String>,
    pub event: ChangeEvent,
    /// 显式节流间隔，为None时按优先级缩放全局节流
    pub throttle: Option<Duration>,
    pub priority: ChannelPriority,
}

impl SubscriptionConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            channel: None,
            schema: None,
            table: table.into(),
            filter: None,
            event: ChangeEvent::All,
            throttle: None,
            priority: ChannelPriority::Medium,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_priority(mut self, priority: ChannelPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn topic(&self, default_schema: &str) -> ChannelTopic {
        ChannelTopic {
            schema: self
                .schema
                .clone()
                .unwrap_or_else(|| default_schema.to_string()),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

/// 节流器整体统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeAnalytics {
    pub total_channels: usize,
    pub total_subscribers: usize,
    pub events_received: u64,
    pub flush_count: u64,
    pub delivered_payloads: u64,
    pub dropped_events: u64,
    pub reconnect_count: u64,
    pub failed_channels: usize,
    pub broadcasts_sent: u64,
    pub global_throttle_ms: u64,
}

/// 连接健康报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    /// 没有处于 `Failed` 状态的通道
    pub healthy: bool,
    pub channels: BTreeMap<String, ChannelState>,
    pub failed: Vec<String>,
}

/// 订阅释放接口，供订阅句柄在不知道订阅源类型的情况下释放通道
trait ChannelRegistry: Send + Sync {
    fn release(&self, topic: &ChannelTopic, subscriber: u64);
}

/// 订阅句柄
///
/// `close` 可重复调用；句柄被丢弃时自动关闭。通道在最后一个句柄关闭后拆除
pub struct RealtimeSubscription {
    id: u64,
    channel: String,
    topic: ChannelTopic,
    registry: Weak<dyn ChannelRegistry>,
    closed: AtomicBool,
}

impl RealtimeSubscription {
    /// 订阅时使用的通道名
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 通道实际绑定的主题
    pub fn topic(&self) -> &ChannelTopic {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.topic, self.id);
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ThrottlerInner<F> {
    feed: Arc<F>,
    schema: String,
    settings: Arc<ChannelSettings>,
    channels: DashMap<ChannelTopic, Arc<Channel>>,
    /// 通道名 -> 主题，包括通道名和主题字符串本身
    aliases: DashMap<String, ChannelTopic>,
    tasks: DashMap<ChannelTopic, JoinHandle<()>>,
    broadcasts: Arc<BroadcastQueue>,
    broadcast_task: std::sync::OnceLock<JoinHandle<()>>,
    broadcasts_sent: AtomicU64,
    cancel: CancellationToken,
    next_subscriber: AtomicU64,
}

impl<F: ChangeFeed> ChannelRegistry for ThrottlerInner<F> {
    // 持有通道条目时再修改别名和任务表，与订阅路径的加锁顺序一致
    fn release(&self, topic: &ChannelTopic, subscriber: u64) {
        let Entry::Occupied(entry) = self.channels.entry(topic.clone()) else {
            return;
        };
        let channel = entry.get().clone();
        let Some((_, left)) = channel.subscribers.remove(&subscriber) else {
            return;
        };

        if channel.subscribers.is_empty() {
            channel.cancel.cancel();
            self.aliases.retain(|_, bound| *bound != *topic);
            self.tasks.remove(topic);
            entry.remove();
            info!("channel {} released by its last subscriber", channel.name);
            return;
        }

        let alias_in_use = left.alias == channel.name
            || left.alias == topic.to_string()
            || channel.subscribers.iter().any(|s| s.alias == left.alias);
        if !alias_in_use {
            self.aliases.remove_if(&left.alias, |_, bound| bound == topic);
        }
        debug!(
            "subscriber {} ({}) left channel {}",
            subscriber, left.alias, channel.name
        );
    }
}

impl<F> ThrottlerInner<F> {
    fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        let topic = self.aliases.get(name).map(|t| t.value().clone())?;
        self.channels.get(&topic).map(|c| c.value().clone())
    }
}

/// 实时更新节流器
pub struct RealtimeThrottler<F> {
    inner: Arc<ThrottlerInner<F>>,
}

impl<F> Clone for RealtimeThrottler<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ChangeFeed> RealtimeThrottler<F> {
    pub fn new(feed: Arc<F>, config: &RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ThrottlerInner {
                feed,
                schema: config.schema.clone(),
                settings: Arc::new(ChannelSettings::from_config(config)),
                channels: DashMap::new(),
                aliases: DashMap::new(),
                tasks: DashMap::new(),
                broadcasts: Arc::new(BroadcastQueue::new()),
                broadcast_task: std::sync::OnceLock::new(),
                broadcasts_sent: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn feed(&self) -> &Arc<F> {
        &self.inner.feed
    }

    /// 订阅变更
    ///
    /// # 参数
    ///
    /// * `config` - 订阅配置
    /// * `callback` - 每次刷新时以合并后的负载调用
    ///
    /// # 返回值
    ///
    /// 返回订阅句柄；同一主题的订阅者共享一个通道和一个变更源订阅。
    /// 通道名已绑定到其他主题时沿用已绑定的主题
    #[instrument(skip(self, callback), level = "debug", fields(table = %config.table))]
    pub fn subscribe_optimized<C>(
        &self,
        config: SubscriptionConfig,
        callback: C,
    ) -> Result<RealtimeSubscription, RealtimeError>
    where
        C: Fn(Vec<ChangePayload>) + Send + Sync + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(RealtimeError::Closed);
        }

        let requested = config.topic(&self.inner.schema);
        let name = config.channel.clone().unwrap_or_else(|| requested.to_string());
        let topic = match self.inner.aliases.get(&name).map(|t| t.value().clone()) {
            Some(bound) if bound != requested => {
                warn!(
                    "channel {} already bound to {}, ignoring requested topic {}",
                    name, bound, requested
                );
                bound
            }
            _ => requested,
        };
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            alias: name.clone(),
            callback: Arc::new(callback),
            throttle: config.throttle,
        };

        match self.inner.channels.entry(topic.clone()) {
            Entry::Occupied(entry) => {
                let channel = entry.get();
                channel.subscribers.insert(id, subscriber);
                self.inner.aliases.insert(name.clone(), topic.clone());
                debug!("subscriber {} joined channel {} as {}", id, channel.name, name);
            }
            Entry::Vacant(entry) => {
                let channel = Channel::new(
                    name.clone(),
                    topic.clone(),
                    config.priority,
                    self.inner.cancel.child_token(),
                );
                channel.subscribers.insert(id, subscriber);
                let handle = tokio::spawn(channel.clone().run(
                    self.inner.feed.clone(),
                    self.inner.settings.clone(),
                ));
                self.inner.tasks.insert(topic.clone(), handle);
                self.inner.aliases.insert(name.clone(), topic.clone());
                self.inner.aliases.insert(topic.to_string(), topic.clone());
                entry.insert(channel);
                info!("channel {} opened on {}", name, topic);
            }
        }

        let registry: Arc<dyn ChannelRegistry> = self.inner.clone();
        Ok(RealtimeSubscription {
            id,
            channel: name,
            topic,
            registry: Arc::downgrade(&registry),
            closed: AtomicBool::new(false),
        })
    }

    /// 在通道上发送应用层广播
    ///
    /// 排队中的广播按优先级发送，同优先级按入队顺序
    #[instrument(skip(self, payload), level = "debug")]
    pub async fn broadcast_optimized(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
        options: BroadcastOptions,
    ) -> Result<(), RealtimeError> {
        if self.inner.cancel.is_cancelled() {
            return Err(RealtimeError::Closed);
        }
        self.ensure_broadcast_task();

        let message = BroadcastMessage {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            event: event.to_string(),
            payload: encode_payload(payload, options.compress)?,
        };
        let reply = self.inner.broadcasts.push(message, options.priority).await;
        let result = reply.await.unwrap_or(Err(RealtimeError::Closed));
        if result.is_ok() {
            self.inner.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        }
        result.map_err(|e| match e {
            RealtimeError::Closed => RealtimeError::Closed,
            other => RealtimeError::Broadcast {
                channel: channel.to_string(),
                message: other.to_string(),
            },
        })
    }

    fn ensure_broadcast_task(&self) {
        self.inner.broadcast_task.get_or_init(|| {
            tokio::spawn(self.inner.broadcasts.clone().run(
                self.inner.feed.clone(),
                self.inner.cancel.child_token(),
            ))
        });
    }

    /// 所有通道的统计，按名称排序
    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> = self
            .inner
            .channels
            .iter()
            .map(|c| c.value().stats(&self.inner.settings))
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn analytics(&self) -> RealtimeAnalytics {
        let stats = self.channel_stats();
        RealtimeAnalytics {
            total_channels: stats.len(),
            total_subscribers: stats.iter().map(|s| s.subscribers).sum(),
            events_received: stats.iter().map(|s| s.events_received).sum(),
            flush_count: stats.iter().map(|s| s.flush_count).sum(),
            delivered_payloads: stats.iter().map(|s| s.delivered_payloads).sum(),
            dropped_events: stats.iter().map(|s| s.dropped_events).sum(),
            reconnect_count: stats.iter().map(|s| s.reconnect_count).sum(),
            failed_channels: stats.iter().filter(|s| s.state.is_failed()).count(),
            broadcasts_sent: self.inner.broadcasts_sent.load(Ordering::Relaxed),
            global_throttle_ms: u64::try_from(self.inner.settings.global_throttle().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        let channels: BTreeMap<String, ChannelState> = self
            .inner
            .channels
            .iter()
            .map(|c| (c.value().name.clone(), c.value().state()))
            .collect();
        let failed: Vec<String> = channels
            .iter()
            .filter(|(_, state)| state.is_failed())
            .map(|(name, _)| name.clone())
            .collect();
        ConnectionHealth {
            healthy: failed.is_empty(),
            channels,
            failed,
        }
    }

    /// 按通道名或主题字符串查询通道状态
    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.inner.channel(channel).map(|c| c.state())
    }

    /// 监听通道状态变化
    pub fn watch_channel(&self, channel: &str) -> Option<watch::Receiver<ChannelState>> {
        self.inner.channel(channel).map(|c| c.watch_state())
    }

    /// 修改通道优先级，之后安排的刷新使用新的节流间隔
    pub fn update_channel_priority(&self, channel: &str, priority: ChannelPriority) -> bool {
        match self.inner.channel(channel) {
            Some(c) => {
                c.set_priority(priority);
                debug!("channel {} priority set to {:?}", channel, priority);
                true
            }
            None => false,
        }
    }

    /// 修改全局节流间隔，已安排的刷新不受影响
    pub fn set_global_throttle(&self, throttle: Duration) {
        self.inner.settings.set_global_throttle(throttle);
        info!("global throttle set to {:?}", throttle);
    }

    /// 重新启用处于 `Failed` 状态的通道
    pub fn reset_channel(&self, channel: &str) -> bool {
        self.inner
            .channel(channel)
            .map(|c| c.reset())
            .unwrap_or(false)
    }

    /// 关闭节流器：取消所有通道任务和广播发送任务，并等待通道退订
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("shutting down realtime throttler");
        self.inner.cancel.cancel();
        self.inner.channels.clear();
        self.inner.aliases.clear();

        let topics: Vec<ChannelTopic> = self.inner.tasks.iter().map(|t| t.key().clone()).collect();
        for topic in topics {
            if let Some((_, handle)) = self.inner.tasks.remove(&topic) {
                if let Err(e) = handle.await {
                    warn!("channel task {} ended abnormally: {}", topic, e);
                }
            }
        }
    }
}
