//! 远程 Agent：经双工通道转发任务并等待异步回复

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::performance::Performance;
use crate::channel::DuplexChannel;
use crate::core::AgentError;
use crate::plugins::PluginDescriptor;
use crate::protocol::{Envelope, AGENT_CLIENT_INSTALL_PACKAGE, AGENT_CLIENT_RUN};
use crate::task::{CorrelationRegistry, Task};

struct AgentState {
    host_name: String,
    performance: Option<Performance>,
    channel: Arc<dyn DuplexChannel>,
    plugins: Vec<PluginDescriptor>,
}

/// 远程 Agent
pub struct Agent {
    id: String,
    state: Mutex<AgentState>,
}

/// Agent 对外快照
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub host_name: String,
    pub performance: Option<Performance>,
    pub plugins: Vec<String>,
    pub online: bool,
}

impl Agent {
    pub(super) fn new(id: impl Into<String>, host_name: String, channel: Arc<dyn DuplexChannel>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(AgentState {
                host_name,
                performance: None,
                channel,
                plugins: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_name(&self) -> String {
        self.state().host_name.clone()
    }

    pub fn channel(&self) -> Arc<dyn DuplexChannel> {
        Arc::clone(&self.state().channel)
    }

    pub fn performance(&self) -> Option<Performance> {
        self.state().performance.clone()
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.state().plugins.clone()
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        self.state().plugins.iter().any(|p| p.key() == key)
    }

    pub(super) fn set_host_name(&self, host_name: String) {
        self.state().host_name = host_name;
    }

    pub(super) fn set_performance(&self, performance: Performance) {
        self.state().performance = Some(performance);
    }

    /// 替换通道，返回被替换的旧通道（ID 不同时）
    pub(super) fn replace_channel(&self, channel: Arc<dyn DuplexChannel>) -> Option<Arc<dyn DuplexChannel>> {
        let mut state = self.state();
        if state.channel.id() == channel.id() {
            state.channel = channel;
            return None;
        }
        Some(std::mem::replace(&mut state.channel, channel))
    }

    /// 清空后重建插件集合，返回旧集合
    pub(super) fn replace_plugins(&self, plugins: Vec<PluginDescriptor>) -> Vec<PluginDescriptor> {
        std::mem::replace(&mut self.state().plugins, plugins)
    }

    pub fn info(&self) -> AgentInfo {
        let state = self.state();
        AgentInfo {
            id: self.id.clone(),
            host_name: state.host_name.clone(),
            performance: state.performance.clone(),
            plugins: state.plugins.iter().map(|p| p.name.clone()).collect(),
            online: state.channel.is_open(),
        }
    }

    /// 发送请求并等待回复载荷
    async fn request(
        &self,
        correlations: &Arc<CorrelationRegistry>,
        envelope: impl FnOnce(&str) -> Envelope,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let channel = self.channel();
        if !channel.is_open() {
            return Err(AgentError::ChannelClosed(self.id.clone()));
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let pending = correlations.register(&correlation_id)?;
        channel
            .send_text(envelope(&correlation_id).to_text())
            .await
            .map_err(AgentError::SendFailed)?;
        Ok(pending.wait(timeout).await?)
    }

    /// 在远端运行任务，回复中的 Output 与 Trace 拷回本地任务
    pub async fn run(
        &self,
        task: &mut Task,
        correlations: &Arc<CorrelationRegistry>,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        tracing::debug!(agent_id = %self.id, task_id = %task.id, "forward task to agent");
        let body = task.to_value();
        let reply = self
            .request(
                correlations,
                |cid| Envelope::request(AGENT_CLIENT_RUN, cid).with("task", body),
                timeout,
            )
            .await?;
        let remote = reply
            .get("task")
            .cloned()
            .ok_or_else(|| AgentError::MalformedReply("missing task".to_string()))?;
        let remote = Task::from_value(remote).map_err(|e| AgentError::MalformedReply(e.to_string()))?;
        task.absorb(remote);
        Ok(())
    }

    /// 让远端安装软件包，返回远端的安装任务
    pub async fn install_package(
        &self,
        name: &str,
        correlations: &Arc<CorrelationRegistry>,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        tracing::info!(agent_id = %self.id, package = %name, "install package on agent");
        let reply = self
            .request(
                correlations,
                |cid| Envelope::request(AGENT_CLIENT_INSTALL_PACKAGE, cid).with("name", name),
                timeout,
            )
            .await?;
        Ok(reply.get("task").cloned().unwrap_or(reply))
    }
}
