//! Agent 注册表
//!
//! Agent 表、注册顺序与反向索引（插件名 → Agent ID）放在同一把写锁下修改，
//! 任一时刻 Agent 的插件集合与反向索引一致。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use super::agent::{Agent, AgentInfo};
use super::performance::Performance;
use crate::channel::DuplexChannel;
use crate::core::AgentError;
use crate::plugins::PluginDescriptor;
use crate::task::{CorrelationRegistry, Task};

#[derive(Default)]
struct AgentTable {
    agents: HashMap<String, Arc<Agent>>,
    /// 注册顺序
    order: Vec<String>,
    /// 插件名（小写）→ Agent ID
    index: HashMap<String, HashSet<String>>,
}

impl AgentTable {
    fn unindex(&mut self, agent_id: &str, plugins: &[PluginDescriptor]) {
        for plugin in plugins {
            let key = plugin.key();
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(agent_id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn reindex(&mut self, agent: &Agent, plugins: Vec<PluginDescriptor>) {
        let old = agent.replace_plugins(Vec::new());
        self.unindex(agent.id(), &old);
        for plugin in &plugins {
            self.index
                .entry(plugin.key())
                .or_default()
                .insert(agent.id().to_string());
        }
        agent.replace_plugins(plugins);
    }

    fn first_capable(&self, name: &str) -> Option<Arc<Agent>> {
        let ids = self.index.get(&name.to_lowercase())?;
        self.order
            .iter()
            .find(|id| ids.contains(*id))
            .and_then(|id| self.agents.get(id))
            .cloned()
    }
}

/// Agent 注册表
pub struct AgentCollection {
    table: RwLock<AgentTable>,
    correlations: Arc<CorrelationRegistry>,
    reply_timeout: Duration,
}

impl AgentCollection {
    pub fn new(correlations: Arc<CorrelationRegistry>, reply_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(AgentTable::default()),
            correlations,
            reply_timeout,
        }
    }

    /// 注册或重注册：已知 ID 替换通道（不同则关闭旧通道），并整体替换插件集合
    pub async fn register(
        &self,
        id: &str,
        host_name: Option<String>,
        channel: Arc<dyn DuplexChannel>,
        plugins: Vec<PluginDescriptor>,
    ) -> Arc<Agent> {
        let (agent, stale) = {
            let mut table = self.table.write().await;
            let (agent, stale) = match table.agents.get(id).cloned() {
                Some(agent) => {
                    let stale = agent.replace_channel(channel);
                    if let Some(host_name) = host_name {
                        agent.set_host_name(host_name);
                    }
                    (agent, stale)
                }
                None => {
                    let agent = Arc::new(Agent::new(id, host_name.unwrap_or_default(), channel));
                    table.agents.insert(id.to_string(), Arc::clone(&agent));
                    table.order.push(id.to_string());
                    (agent, None)
                }
            };
            table.reindex(&agent, plugins);
            (agent, stale)
        };

        if let Some(stale) = stale {
            tracing::info!(agent_id = %id, "agent reconnected, closing stale channel");
            stale.close().await;
        }
        tracing::info!(agent_id = %id, plugins = agent.plugins().len(), "agent registered");
        agent
    }

    /// 整体替换插件集合
    pub async fn update_plugins(&self, id: &str, plugins: Vec<PluginDescriptor>) -> Result<(), AgentError> {
        let mut table = self.table.write().await;
        let agent = table
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        table.reindex(&agent, plugins);
        Ok(())
    }

    pub async fn update_performance(&self, id: &str, performance: Performance) -> Result<(), AgentError> {
        let agent = self.get(id).await.ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        agent.set_performance(performance);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.table.read().await.agents.get(id).cloned()
    }

    /// 能处理该任务的第一个 Agent（按注册顺序）
    pub async fn try_get_agent(&self, task: &Task) -> Option<Arc<Agent>> {
        self.try_get_plugin(task.capability()).await
    }

    /// 通告了该插件的第一个 Agent（按注册顺序）
    pub async fn try_get_plugin(&self, name: &str) -> Option<Arc<Agent>> {
        self.table.read().await.first_capable(name)
    }

    /// 移除 Agent：尽力关闭通道并清空插件集合
    pub async fn exit(&self, id: &str) -> bool {
        let agent = {
            let mut table = self.table.write().await;
            let Some(agent) = table.agents.remove(id) else {
                return false;
            };
            table.order.retain(|a| a != id);
            let plugins = agent.replace_plugins(Vec::new());
            table.unindex(id, &plugins);
            agent
        };
        agent.channel().close().await;
        tracing::info!(agent_id = %id, "agent exited");
        true
    }

    /// 移除注册在该通道上的全部 Agent（连接断开时调用）
    pub async fn exit_channel(&self, channel_id: &str) -> Vec<String> {
        let ids: Vec<String> = {
            let table = self.table.read().await;
            table
                .order
                .iter()
                .filter(|id| {
                    table
                        .agents
                        .get(*id)
                        .map(|a| a.channel().id() == channel_id)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for id in &ids {
            self.exit(id).await;
        }
        ids
    }

    /// 经 Agent 运行任务；通道层失败时驱逐该 Agent 后返回错误
    pub async fn run(&self, agent: &Agent, task: &mut Task) -> Result<(), AgentError> {
        let result = agent.run(task, &self.correlations, self.reply_timeout).await;
        if let Err(e) = &result {
            if e.is_transport() {
                tracing::warn!(agent_id = %agent.id(), "agent transport failed, evicting: {}", e);
                self.exit(agent.id()).await;
            }
        }
        result
    }

    pub async fn install_package(&self, id: &str, name: &str) -> Result<Value, AgentError> {
        let agent = self.get(id).await.ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        let result = agent
            .install_package(name, &self.correlations, self.reply_timeout)
            .await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.exit(id).await;
            }
        }
        result
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.agents.get(id))
            .map(|a| a.info())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
