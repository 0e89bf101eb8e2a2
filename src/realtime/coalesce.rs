//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 变更负载合并

use super::feed::ChangePayload;
use ahash::AHashMap;

/// 合并缓冲区中的负载
///
/// 带记录标识的负载按标识保留最后一次写入，位置取该标识首次出现的位置；
/// 没有标识的负载原样按顺序保留
pub fn coalesce(payloads: Vec<ChangePayload>) -> Vec<ChangePayload> {
    let mut slots: Vec<Option<ChangePayload>> = Vec::with_capacity(payloads.len());
    let mut index: AHashMap<String, usize> = AHashMap::with_capacity(payloads.len());

    for payload in payloads {
        match payload.record_id() {
            Some(id) => match index.get(&id) {
                Some(&slot) => slots[slot] = Some(payload),
                None => {
                    index.insert(id, slots.len());
                    slots.push(Some(payload));
                }
            },
            None => slots.push(Some(payload)),
        }
    }

    slots.into_iter().flatten().collect()
}
