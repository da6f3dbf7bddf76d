//! 错误类型
//!
//! 按关注点划分：任务生命周期（TaskError）、远程 Agent（AgentError）、Hub 中继（RelayError）。
//! 插件相关错误见 `plugins::PluginError`。执行器与分发层的错误最终都写入任务 Trace，不会越过 complete_task。

use thiserror::Error;

/// 任务生命周期错误（排队、关联等待、查询）
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Task not in flight: {0}")]
    NotInFlight(String),

    #[error("Reply timeout after {0}s")]
    Timeout(u64),

    #[error("Reply channel dropped: {0}")]
    Dropped(String),

    #[error("Task decode error: {0}")]
    Decode(String),
}

/// 远程 Agent 错误；`is_transport()` 为真时分发状态机会驱逐该 Agent 并换一个重试
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent channel closed: {0}")]
    ChannelClosed(String),

    #[error("Agent send failed: {0}")]
    SendFailed(String),

    #[error("Agent reply failed: {0}")]
    Reply(#[from] TaskError),

    #[error("Malformed agent reply: {0}")]
    MalformedReply(String),

    #[error("Agent not found: {0}")]
    NotFound(String),
}

impl AgentError {
    /// 通道层失败（已关闭 / 发送失败）
    pub fn is_transport(&self) -> bool {
        matches!(self, AgentError::ChannelClosed(_) | AgentError::SendFailed(_))
    }
}

/// Hub 中继错误
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay disabled")]
    Disabled,

    #[error("Not connected to hub")]
    NotConnected,

    #[error("Hub connect failed: {0}")]
    Connect(String),

    #[error("Hub send failed: {0}")]
    Send(String),

    #[error("Hub reply failed: {0}")]
    Reply(#[from] TaskError),

    #[error("Hub http url not configured")]
    NoHttpUrl,

    #[error("Hub http error: {0}")]
    Http(String),
}
