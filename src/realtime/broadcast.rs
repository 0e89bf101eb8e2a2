//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了广播消息的编码和按优先级发送的队列。

use super::feed::{BroadcastMessage, BroadcastPayload, ChangeFeed};
use crate::error::RealtimeError;
use crate::metrics::GLOBAL_METRICS;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 广播优先级，队列中 High 先发送
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BroadcastPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl BroadcastPriority {
    fn rank(&self) -> u8 {
        match self {
            BroadcastPriority::High => 2,
            BroadcastPriority::Normal => 1,
            BroadcastPriority::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub compress: bool,
    pub priority: BroadcastPriority,
}

/// 编码广播负载
///
/// 未启用 `flate2` 特性时忽略压缩请求，返回原始 JSON
pub fn encode_payload(payload: Value, compress: bool) -> Result<BroadcastPayload, RealtimeError> {
    if !compress {
        return Ok(BroadcastPayload::Json(payload));
    }

    #[cfg(feature = "flate2")]
    {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let json_bytes =
            serde_json::to_vec(&payload).map_err(|e| RealtimeError::Encoding(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&json_bytes)
            .map_err(|e| RealtimeError::Encoding(e.to_string()))?;
        encoder
            .finish()
            .map(BroadcastPayload::Gzip)
            .map_err(|e| RealtimeError::Encoding(e.to_string()))
    }

    #[cfg(not(feature = "flate2"))]
    {
        Ok(BroadcastPayload::Json(payload))
    }
}

/// 解码广播负载
pub fn decode_payload(payload: &BroadcastPayload) -> Result<Value, RealtimeError> {
    match payload {
        BroadcastPayload::Json(value) => Ok(value.clone()),
        #[cfg(feature = "flate2")]
        BroadcastPayload::Gzip(bytes) => {
            use flate2::read::GzDecoder;
            use std::io::Read;

            let mut decoder = GzDecoder::new(bytes.as_slice());
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|e| RealtimeError::Encoding(e.to_string()))?;
            serde_json::from_slice(&decoded).map_err(|e| RealtimeError::Encoding(e.to_string()))
        }
        #[cfg(not(feature = "flate2"))]
        BroadcastPayload::Gzip(_) => Err(RealtimeError::Encoding(
            "gzip payloads require the flate2 feature".to_string(),
        )),
    }
}

struct Queued {
    priority: BroadcastPriority,
    seq: u64,
    message: BroadcastMessage,
    reply: oneshot::Sender<Result<(), RealtimeError>>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// 优先级高者在前，同优先级按入队顺序
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 广播发送队列
///
/// 由单个发送任务按优先级顺序取出消息并交给订阅源
pub(crate) struct BroadcastQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
    seq: AtomicU64,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub async fn push(
        &self,
        message: BroadcastMessage,
        priority: BroadcastPriority,
    ) -> oneshot::Receiver<Result<(), RealtimeError>> {
        let (reply, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(Queued {
            priority,
            seq,
            message,
            reply,
        });
        self.notify.notify_one();
        rx
    }

    /// 发送循环，取消后以 `Closed` 结束仍在排队的消息
    pub async fn run<F: ChangeFeed>(self: Arc<Self>, feed: Arc<F>, cancel: CancellationToken) {
        loop {
            let next = self.heap.lock().await.pop();
            match next {
                Some(queued) => {
                    let channel = queued.message.channel.clone();
                    let result = feed.broadcast(queued.message).await;
                    match &result {
                        Ok(()) => {
                            debug!("broadcast sent on {}", channel);
                            GLOBAL_METRICS.record_request("realtime", "broadcast", "success");
                        }
                        Err(e) => {
                            warn!("broadcast on {} failed: {}", channel, e);
                            GLOBAL_METRICS.record_request("realtime", "broadcast", "failure");
                        }
                    }
                    let _ = queued.reply.send(result);
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        let mut heap = self.heap.lock().await;
        for queued in heap.drain() {
            let _ = queued.reply.send(Err(RealtimeError::Closed));
        }
    }
}
