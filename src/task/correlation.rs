//! 关联等待表（request ID → 待决结果）
//!
//! 「经通道发送」与「等待回复」之间唯一的汇合点：回复可能在任意连接上、以任意顺序到达。
//! 每个 ID 至多解析一次，重复 complete 返回 false；等待超时或句柄被丢弃时条目自动移除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::TaskError;

type Slot = (u64, oneshot::Sender<Value>);

/// 关联等待表
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记一个待决 ID；同一 ID 已在等待中则失败
    pub fn register(self: &Arc<Self>, id: &str) -> Result<PendingReply, TaskError> {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.lock();
            if map.contains_key(id) {
                return Err(TaskError::AlreadyInFlight(id.to_string()));
            }
            map.insert(id.to_string(), (generation, tx));
        }
        Ok(PendingReply {
            id: id.to_string(),
            generation,
            rx: Some(rx),
            registry: Arc::clone(self),
        })
    }

    /// 解析 ID；不存在（未登记、已解析、已超时）时返回 false
    pub fn complete(&self, id: &str, value: Value) -> bool {
        let slot = self.lock().remove(id);
        match slot {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(correlation_id = %id, "late or duplicate reply ignored");
                false
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn abandon(&self, id: &str, generation: u64) {
        let mut map = self.lock();
        if map.get(id).map(|(g, _)| *g == generation).unwrap_or(false) {
            map.remove(id);
        }
    }
}

/// 待决回复句柄；丢弃即放弃等待
pub struct PendingReply {
    id: String,
    generation: u64,
    rx: Option<oneshot::Receiver<Value>>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 在超时内等待解析结果
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, TaskError> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(TaskError::Dropped(self.id.clone())),
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TaskError::Dropped(self.id.clone())),
            Err(_) => {
                tracing::warn!(correlation_id = %self.id, "reply timed out after {:?}", timeout);
                Err(TaskError::Timeout(timeout.as_secs()))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.abandon(&self.id, self.generation);
    }
}
