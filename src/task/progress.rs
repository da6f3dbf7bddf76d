//! 进度订阅：任务 ID 与一条通道的临时绑定

use std::sync::Arc;

use serde_json::Value;

use crate::channel::DuplexChannel;
use crate::protocol::{Envelope, TASK_UPDATE_PROGRESS};

/// 进度订阅者；任务完成时关闭（可选连带关闭底层通道）
pub struct ProgressSubscriber {
    task_id: String,
    channel: Arc<dyn DuplexChannel>,
    close_on_complete: bool,
}

impl ProgressSubscriber {
    pub fn new(task_id: impl Into<String>, channel: Arc<dyn DuplexChannel>, close_on_complete: bool) -> Self {
        Self {
            task_id: task_id.into(),
            channel,
            close_on_complete,
        }
    }

    /// 推送一条进度：`{url, task_id, progress}`；返回是否送达
    pub async fn send(&self, progress: &Value) -> bool {
        let envelope = Envelope::new(TASK_UPDATE_PROGRESS)
            .with("task_id", self.task_id.as_str())
            .with("progress", progress.clone());
        match self.channel.send_text(envelope.to_text()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(task_id = %self.task_id, "progress delivery failed: {}", e);
                false
            }
        }
    }

    pub async fn close(self) {
        if self.close_on_complete {
            self.channel.close().await;
        }
    }
}
