//! 分发状态机
//!
//! 每个出队任务依次经历：本地插件 → 远程 Agent → Hub 中继 → 未解析。
//! 本地插件命中即终止（无论成败）；Agent 通道层失败时驱逐并换一个能处理的 Agent 重试，
//! 直到成功或没有可用 Agent；其它 Agent 错误直接记入 Trace。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::AgentCollection;
use crate::plugins::{PluginExecutor, PluginRegistry};
use crate::relay::HubRelay;
use crate::task::{ProcessorType, Task, TaskHandler};

/// 未找到可执行方时写入 Trace 的消息
pub const PLUGIN_NOT_FOUND: &str = "plugin not found";

/// 分发状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    LocalPlugin,
    RemoteAgent,
    HubRelay,
    Unresolved,
    Done,
}

/// 分发器
pub struct Dispatcher {
    plugins: Arc<PluginRegistry>,
    executor: PluginExecutor,
    agents: Arc<AgentCollection>,
    relay: Option<Arc<HubRelay>>,
}

impl Dispatcher {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        executor: PluginExecutor,
        agents: Arc<AgentCollection>,
        relay: Option<Arc<HubRelay>>,
    ) -> Self {
        Self {
            plugins,
            executor,
            agents,
            relay,
        }
    }

    /// 执行一个状态并返回下一个状态
    async fn step(&self, state: DispatchState, task: &mut Task) -> DispatchState {
        match state {
            DispatchState::LocalPlugin => match self.plugins.try_get_plugin(task.capability()).await {
                Some(descriptor) => {
                    tracing::debug!(task_id = %task.id, plugin = %descriptor.name, "dispatch to local plugin");
                    self.executor.run(&descriptor, task).await;
                    DispatchState::Done
                }
                None => DispatchState::RemoteAgent,
            },
            DispatchState::RemoteAgent => {
                let Some(mut agent) = self.agents.try_get_agent(task).await else {
                    return DispatchState::HubRelay;
                };
                loop {
                    match self.agents.run(&agent, task).await {
                        Ok(()) => return DispatchState::Done,
                        Err(e) if e.is_transport() => {
                            tracing::warn!(task_id = %task.id, agent_id = %agent.id(), "agent unreachable, trying another: {}", e);
                            match self.agents.try_get_agent(task).await {
                                Some(next) => agent = next,
                                None => return DispatchState::Unresolved,
                            }
                        }
                        Err(e) => {
                            task.trace.error(format!("agent {} failed: {}", agent.id(), e));
                            return DispatchState::Done;
                        }
                    }
                }
            }
            DispatchState::HubRelay => match self.relay.as_ref().filter(|r| r.is_enabled()) {
                Some(relay) => {
                    tracing::debug!(task_id = %task.id, "dispatch to hub relay");
                    if let Err(e) = relay.run(task).await {
                        task.trace.error(format!("hub relay failed: {}", e));
                    }
                    DispatchState::Done
                }
                None => DispatchState::Unresolved,
            },
            DispatchState::Unresolved => {
                tracing::warn!(task_id = %task.id, plugin = %task.capability(), "no executor for task");
                task.trace.error(PLUGIN_NOT_FOUND);
                DispatchState::Done
            }
            DispatchState::Done => DispatchState::Done,
        }
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, task: &mut Task) {
        if task.processor.kind != ProcessorType::Plugin {
            task.trace
                .error(format!("unsupported processor type: {:?}", task.processor.kind));
            return;
        }

        let mut state = DispatchState::LocalPlugin;
        while state != DispatchState::Done {
            state = self.step(state, task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::RelaySection;
    use crate::plugins::{PluginDescriptor, ProcessScriptHost};
    use crate::task::CorrelationRegistry;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        plugins: Arc<PluginRegistry>,
        agents: Arc<AgentCollection>,
    }

    fn fixture(relay: Option<Arc<HubRelay>>) -> Fixture {
        let correlations = Arc::new(CorrelationRegistry::new());
        let plugins = Arc::new(PluginRegistry::new("unused"));
        let agents = Arc::new(AgentCollection::new(correlations, Duration::from_secs(5)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let executor = PluginExecutor::new("http://127.0.0.1:9701", Arc::new(ProcessScriptHost::default()), tx);
        Fixture {
            dispatcher: Dispatcher::new(Arc::clone(&plugins), executor, Arc::clone(&agents), relay),
            plugins,
            agents,
        }
    }

    #[tokio::test]
    async fn test_non_plugin_processor_rejected() {
        let f = fixture(None);
        let mut task = Task::default();
        f.dispatcher.handle(&mut task).await;
        assert!(task.trace.message.unwrap().contains("unsupported processor type"));
    }

    #[tokio::test]
    async fn test_unresolved_without_any_executor() {
        let f = fixture(None);
        let mut task = Task::plugin("ghost", json!(1));
        f.dispatcher.handle(&mut task).await;
        assert_eq!(task.trace.message.as_deref(), Some(PLUGIN_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_disabled_relay_is_skipped() {
        let relay = Arc::new(HubRelay::new(
            RelaySection::default(),
            Arc::new(PluginRegistry::new("unused")),
            Arc::new(CorrelationRegistry::new()),
        ));
        let f = fixture(Some(relay));
        let mut task = Task::plugin("ghost", json!(1));
        f.dispatcher.handle(&mut task).await;
        assert_eq!(task.trace.message.as_deref(), Some(PLUGIN_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_local_plugin_wins() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(None);
        f.plugins
            .load_descriptors(vec![(
                PluginDescriptor::new("echo", "", "cat {input} > {output}").with_dir(dir.path()),
                PathBuf::from("echo"),
            )])
            .await;
        let (ch, mut rx) = MemoryChannel::new("c1");
        f.agents
            .register("a1", None, ch, vec![PluginDescriptor::new("echo", "", "")])
            .await;

        let mut task = Task::plugin("ECHO", json!("hi"));
        f.dispatcher.handle(&mut task).await;
        assert_eq!(task.output, Some(json!("hi")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_failures_fall_through_all_agents() {
        let f = fixture(None);
        for id in ["a1", "a2"] {
            let (ch, _rx) = MemoryChannel::new(id);
            ch.fail_sends();
            f.agents
                .register(id, None, ch, vec![PluginDescriptor::new("remote", "", "")])
                .await;
        }

        let mut task = Task::plugin("remote", json!(1));
        f.dispatcher.handle(&mut task).await;
        assert_eq!(task.trace.message.as_deref(), Some(PLUGIN_NOT_FOUND));
        assert!(f.agents.is_empty().await);
    }
}
