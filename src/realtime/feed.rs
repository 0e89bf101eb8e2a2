//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了变更订阅源的接口及其消息类型。

use crate::error::RealtimeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 变更事件类型，`All` 对应订阅中的 `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    #[default]
    #[serde(rename = "*")]
    All,
    Insert,
    Update,
    Delete,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::All => "*",
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
        }
    }

    /// 订阅的事件类型是否接收给定事件
    pub fn accepts(&self, event: ChangeEvent) -> bool {
        *self == ChangeEvent::All || *self == event
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订阅主题
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTopic {
    pub schema: String,
    pub table: String,
    pub event: ChangeEvent,
    /// 行过滤条件，例如 `trip_id=eq.42`
    pub filter: Option<String>,
}

impl ChannelTopic {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event: ChangeEvent::All,
            filter: None,
        }
    }

    pub fn with_event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Display for ChannelTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.schema, self.table, self.event)?;
        if let Some(filter) = &self.filter {
            write!(f, ":{}", filter)?;
        }
        Ok(())
    }
}

/// 单条变更负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub event: ChangeEvent,
    pub schema: String,
    pub table: String,
    pub new_record: Option<Value>,
    pub old_record: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangePayload {
    pub fn new(event: ChangeEvent, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event,
            schema: schema.into(),
            table: table.into(),
            new_record: None,
            old_record: None,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn with_new(mut self, record: Value) -> Self {
        self.new_record = Some(record);
        self
    }

    pub fn with_old(mut self, record: Value) -> Self {
        self.old_record = Some(record);
        self
    }

    /// 记录标识：新记录的 `id`，否则旧记录的 `id`
    pub fn record_id(&self) -> Option<String> {
        let id = self
            .new_record
            .as_ref()
            .and_then(|r| r.get("id"))
            .or_else(|| self.old_record.as_ref().and_then(|r| r.get("id")))?;
        match id {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// 订阅流中的事件
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangePayload),
    /// 传输层错误，通道需要重连
    Error(String),
}

/// 广播负载
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    Json(Value),
    /// gzip 压缩后的 JSON
    Gzip(Vec<u8>),
}

/// 应用层广播消息
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub id: Uuid,
    pub channel: String,
    pub event: String,
    pub payload: BroadcastPayload,
}

/// 变更源上的一个订阅流
#[derive(Debug)]
pub struct FeedStream {
    /// 由变更源分配，退订时只关闭该流
    pub id: u64,
    pub events: mpsc::Receiver<FeedEvent>,
}

/// 变更订阅源
///
/// 每次 `subscribe` 返回一个新的事件流；流关闭或产生 `FeedEvent::Error` 时视为连接断开。
/// 同一主题上可以同时存在多个流，`unsubscribe` 只影响指定的流
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, topic: &ChannelTopic) -> Result<FeedStream, RealtimeError>;

    async fn unsubscribe(&self, stream: u64);

    async fn broadcast(&self, message: BroadcastMessage) -> Result<(), RealtimeError>;
}
