//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 进程内变更订阅源，用于本地模拟和测试。

use super::feed::{
    BroadcastMessage, ChangeFeed, ChangePayload, ChannelTopic, FeedEvent, FeedStream,
};
use crate::error::RealtimeError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// 进程内变更订阅源
///
/// 支持注入订阅失败和连接错误
pub struct InMemoryFeed {
    streams: DashMap<u64, (ChannelTopic, mpsc::Sender<FeedEvent>)>,
    next_stream: AtomicU64,
    capacity: usize,
    /// 剩余需要失败的订阅次数，`u32::MAX` 表示一直失败
    failing_subscribes: AtomicU32,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    broadcasts: Mutex<Vec<BroadcastMessage>>,
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// 指定每个订阅流的缓冲容量
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: DashMap::new(),
            next_stream: AtomicU64::new(1),
            capacity: capacity.max(1),
            failing_subscribes: AtomicU32::new(0),
            subscribe_calls: AtomicU64::new(0),
            unsubscribe_calls: AtomicU64::new(0),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    /// 之后的 `count` 次订阅失败
    pub fn fail_next_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::Relaxed);
    }

    /// 之后的所有订阅都失败
    pub fn fail_all_subscribes(&self) {
        self.failing_subscribes.store(u32::MAX, Ordering::Relaxed);
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    pub fn unsubscribe_calls(&self) -> u64 {
        self.unsubscribe_calls.load(Ordering::Relaxed)
    }

    /// 当前仍打开的订阅流数量
    pub fn active_subscriptions(&self) -> usize {
        self.streams
            .iter()
            .filter(|e| !e.value().1.is_closed())
            .count()
    }

    pub async fn broadcasts(&self) -> Vec<BroadcastMessage> {
        self.broadcasts.lock().await.clone()
    }

    /// 向所有匹配的订阅流发布变更，返回送达的流数量
    pub async fn publish(&self, payload: ChangePayload) -> usize {
        let targets: Vec<mpsc::Sender<FeedEvent>> = self
            .streams
            .iter()
            .filter(|e| topic_matches(&e.value().0, &payload))
            .map(|e| e.value().1.clone())
            .collect();

        let mut delivered = 0;
        for tx in targets {
            if tx.send(FeedEvent::Change(payload.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// 向某张表的所有订阅流发送连接错误并断开它们
    pub async fn inject_error(&self, table: &str, reason: &str) -> usize {
        let ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|e| e.value().0.table == table)
            .map(|e| *e.key())
            .collect();

        let mut disconnected = 0;
        for id in ids {
            let Some((_, (_, tx))) = self.streams.remove(&id) else {
                continue;
            };
            if tx.send(FeedEvent::Error(reason.to_string())).await.is_ok() {
                disconnected += 1;
            }
        }
        debug!("injected error on table {}: {} streams", table, disconnected);
        disconnected
    }
}

#[async_trait]
impl ChangeFeed for InMemoryFeed {
    async fn subscribe(&self, topic: &ChannelTopic) -> Result<FeedStream, RealtimeError> {
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);

        let remaining = self.failing_subscribes.load(Ordering::Relaxed);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failing_subscribes.store(remaining - 1, Ordering::Relaxed);
            }
            return Err(RealtimeError::Subscribe {
                topic: topic.to_string(),
                message: "subscription rejected".to_string(),
            });
        }

        let (tx, events) = mpsc::channel(self.capacity);
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(id, (topic.clone(), tx));
        debug!("in-memory feed stream {} subscribed {}", id, topic);
        Ok(FeedStream { id, events })
    }

    async fn unsubscribe(&self, stream: u64) {
        self.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        if self.streams.remove(&stream).is_some() {
            debug!("in-memory feed stream {} unsubscribed", stream);
        }
    }

    async fn broadcast(&self, message: BroadcastMessage) -> Result<(), RealtimeError> {
        self.broadcasts.lock().await.push(message);
        Ok(())
    }
}

/// 变更是否匹配订阅主题
///
/// 过滤条件只支持 `column=eq.value` 形式，无法解析的过滤条件视为匹配
fn topic_matches(topic: &ChannelTopic, payload: &ChangePayload) -> bool {
    if topic.schema != payload.schema
        || topic.table != payload.table
        || !topic.event.accepts(payload.event)
    {
        return false;
    }
    let Some(filter) = &topic.filter else {
        return true;
    };
    let Some((column, expected)) = filter
        .split_once('=')
        .and_then(|(column, op)| op.strip_prefix("eq.").map(|value| (column, value)))
    else {
        return true;
    };

    [&payload.new_record, &payload.old_record]
        .into_iter()
        .flatten()
        .filter_map(|record| record.get(column))
        .any(|value| match value {
            Value::String(s) => s == expected,
            other => other.to_string() == expected,
        })
}
