//! progress.log 跟踪
//!
//! 插件按行追加 `"<id> <json>"` 记录；同一 `<id>` 只转发一次，转发顺序与写入顺序一致。
//! 结束时做最后一次读取，不完整的末行也一并处理。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 轮询间隔
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 一条进度：交由生命周期管理器转发给订阅者
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: Value,
}

struct TailState {
    path: PathBuf,
    task_id: String,
    offset: usize,
    seen: HashSet<String>,
    sink: mpsc::UnboundedSender<ProgressUpdate>,
}

impl TailState {
    async fn poll(&mut self, final_pass: bool) {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(_) => return,
        };
        if bytes.len() <= self.offset {
            return;
        }
        let fresh = &bytes[self.offset..];
        let consumed = if final_pass {
            fresh.len()
        } else {
            match fresh.iter().rposition(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                None => return,
            }
        };
        let chunk = String::from_utf8_lossy(&fresh[..consumed]).into_owned();
        self.offset += consumed;

        for line in chunk.lines() {
            if let Some((id, progress)) = parse_line(line) {
                if self.seen.insert(id.to_string()) {
                    let _ = self.sink.send(ProgressUpdate {
                        task_id: self.task_id.clone(),
                        progress,
                    });
                }
            }
        }
    }
}

/// 解析一行 `"<id> <json>"`
pub fn parse_line(line: &str) -> Option<(&str, Value)> {
    let line = line.trim();
    let (id, rest) = line.split_once(char::is_whitespace)?;
    match serde_json::from_str(rest.trim()) {
        Ok(value) => Some((id, value)),
        Err(e) => {
            tracing::debug!("bad progress line {:?}: {}", line, e);
            None
        }
    }
}

/// 后台跟踪任务
pub struct ProgressTail {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressTail {
    pub fn spawn(path: PathBuf, task_id: impl Into<String>, sink: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let mut state = TailState {
            path,
            task_id: task_id.into(),
            offset: 0,
            seen: HashSet::new(),
            sink,
        };

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(PROGRESS_POLL_INTERVAL) => state.poll(false).await,
                }
            }
            state.poll(true).await;
        });

        Self { stop, handle }
    }

    /// 停止跟踪并完成最后一次读取
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("progress tail aborted: {}", e);
        }
    }
}
