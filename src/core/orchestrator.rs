//! 编排根
//!
//! 持有全部共享注册表（插件、Agent、任务缓存、关联等待表）与 Hub 中继，
//! 对外提供任务提交与查询，并作为 `MessageHandler` 路由双工通道上的入站信封。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::dispatch::Dispatcher;
use super::error::TaskError;
use super::shutdown::ShutdownManager;
use crate::agents::{AgentCollection, Performance};
use crate::channel::{DuplexChannel, MessageHandler};
use crate::config::AppConfig;
use crate::plugins::{PluginDescriptor, PluginExecutor, PluginRegistry, ProcessScriptHost, ScriptHost};
use crate::protocol::*;
use crate::relay::{HubRelay, RunningCounter};
use crate::task::{CorrelationRegistry, LifecycleConfig, Task, TaskId, TaskManager};

/// 编排根
pub struct Orchestrator {
    config: AppConfig,
    correlations: Arc<CorrelationRegistry>,
    plugins: Arc<PluginRegistry>,
    agents: Arc<AgentCollection>,
    relay: Arc<HubRelay>,
    tasks: Arc<TaskManager>,
    shutdown: Arc<ShutdownManager>,
}

impl Orchestrator {
    /// 使用默认脚本宿主（按 `[script].interpreter` 启动进程）
    pub fn new(config: AppConfig) -> Arc<Self> {
        let host = Arc::new(ProcessScriptHost::new(config.script.interpreter.clone()));
        Self::with_script_host(config, host)
    }

    pub fn with_script_host(config: AppConfig, script_host: Arc<dyn ScriptHost>) -> Arc<Self> {
        let correlations = Arc::new(CorrelationRegistry::new());
        let plugins = Arc::new(PluginRegistry::new(config.plugins.dir.clone()));
        let agents = Arc::new(AgentCollection::new(
            Arc::clone(&correlations),
            std::time::Duration::from_secs(config.tasks.reply_timeout_secs),
        ));
        let relay = Arc::new(HubRelay::new(
            config.relay.clone(),
            Arc::clone(&plugins),
            Arc::clone(&correlations),
        ));

        // {Server}：启用中继时指向 Hub，否则指向本节点
        let server_url = relay
            .http_url()
            .filter(|_| config.relay.enabled)
            .map(str::to_string)
            .unwrap_or_else(|| config.server.public_url.clone());
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let executor = PluginExecutor::new(server_url, script_host, progress_tx);

        let dispatcher = Dispatcher::new(
            Arc::clone(&plugins),
            executor,
            Arc::clone(&agents),
            Some(Arc::clone(&relay)),
        );
        let tasks = TaskManager::new(
            Arc::new(dispatcher),
            Arc::clone(&plugins),
            Arc::clone(&correlations),
            LifecycleConfig {
                retention: std::time::Duration::from_secs(config.tasks.retention_secs),
                reply_timeout: std::time::Duration::from_secs(config.tasks.reply_timeout_secs),
            },
        );
        tasks.pump_progress(progress_rx);

        Arc::new(Self {
            config,
            correlations,
            plugins,
            agents,
            relay,
            tasks,
            shutdown: Arc::new(ShutdownManager::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn agents(&self) -> &Arc<AgentCollection> {
        &self.agents
    }

    pub fn relay(&self) -> &Arc<HubRelay> {
        &self.relay
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn correlations(&self) -> &Arc<CorrelationRegistry> {
        &self.correlations
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 启动后台例程：插件初次加载与目录监听，首次加载后启动中继循环
    pub async fn start(self: &Arc<Self>) {
        let token = self.shutdown.token();

        let relay = Arc::clone(&self.relay);
        let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
        let tasks = Arc::downgrade(&self.tasks);
        let running: RunningCounter = Arc::new(move || tasks.upgrade().map(|t| t.running_count()).unwrap_or(0));
        let relay_token = token.clone();

        if !self.config.plugins.enabled {
            if let Err(e) = self.plugins.set_enabled(false).await {
                tracing::error!("plugin registry disable failed: {}", e);
            }
            relay.start(handler, running, relay_token);
            return;
        }

        self.plugins.on_first_load(move || {
            relay.start(handler, running, relay_token);
        });
        if let Err(e) = self.plugins.set_enabled(true).await {
            tracing::error!(dir = %self.plugins.dir().display(), "initial plugin load failed: {}", e);
        }
        if let Err(e) = self.plugins.watch(self.config.plugins.reload_debounce(), token) {
            tracing::error!(dir = %self.plugins.dir().display(), "plugin watcher failed: {}", e);
        }
    }

    /// 取消全部后台例程
    pub fn shutdown(&self) {
        self.shutdown.shutdown(super::shutdown::ShutdownReason::UserInitiated);
    }

    /// 提交任务并等待完成
    pub async fn run(self: &Arc<Self>, task: Task) -> Result<Task, TaskError> {
        self.tasks.run(task).await
    }

    /// 提交任务，立即返回任务 ID
    pub async fn run_async(self: &Arc<Self>, task: Task) -> Result<TaskId, TaskError> {
        self.tasks.run_async(task).await
    }

    /// 在保留期内查询任务
    pub async fn query(&self, id: &str) -> Option<Task> {
        self.tasks.try_get(id).await
    }

    pub async fn subscribe(&self, id: &str, channel: Arc<dyn DuplexChannel>) -> Result<(), TaskError> {
        self.tasks.subscribe_progress(id, channel).await
    }

    pub async fn run_and_subscribe_progress(
        self: &Arc<Self>,
        task: Task,
        channel: Arc<dyn DuplexChannel>,
        close_on_complete: bool,
    ) -> Result<Task, TaskError> {
        self.tasks.run_and_subscribe_progress(task, channel, close_on_complete).await
    }

    /// 路由一个入站信封；返回需要回复的载荷
    async fn route(&self, channel: &Arc<dyn DuplexChannel>, request: &Envelope) -> Option<Value> {
        let reply = match request.url.as_str() {
            RESPONSE => {
                let id = request.websocket_session_id.clone().unwrap_or_default();
                if !self.correlations.complete(&id, request.clone().into_payload()) {
                    tracing::debug!(correlation_id = %id, "reply without waiter dropped");
                }
                return None;
            }
            AGENT_REGISTER => match request.get_str("agent_id").filter(|id| !id.is_empty()) {
                Some(agent_id) => {
                    let host_name = request.get_str("host_name").map(str::to_string);
                    let plugins = decode_plugins(request.get("plugins"));
                    self.agents
                        .register(agent_id, host_name, Arc::clone(channel), plugins)
                        .await;
                    json!({"ok": true})
                }
                None => json!({"error": "missing agent_id"}),
            },
            AGENT_UPDATE_PERFORMANCE => {
                let agent_id = request.get_str("agent_id").unwrap_or_default();
                let performance = request
                    .get("performance")
                    .cloned()
                    .map(serde_json::from_value::<Performance>);
                match performance {
                    Some(Ok(performance)) => ok_or_error(self.agents.update_performance(agent_id, performance).await),
                    Some(Err(e)) => json!({"error": format!("invalid performance: {}", e)}),
                    None => json!({"error": "missing performance"}),
                }
            }
            AGENT_UPDATE_PLUGINS => {
                let agent_id = request.get_str("agent_id").unwrap_or_default();
                let plugins = decode_plugins(request.get("plugins"));
                ok_or_error(self.agents.update_plugins(agent_id, plugins).await)
            }
            AGENT_LIST => json!({"agents": self.agents.list().await}),
            AGENT_INSTALL_PACKAGE => {
                let agent_id = request.get_str("agent_id").unwrap_or_default();
                let name = request.get_str("name").unwrap_or_default();
                match self.agents.install_package(agent_id, name).await {
                    Ok(task) => json!({"task": task}),
                    Err(e) => json!({"error": e.to_string()}),
                }
            }
            AGENT_CLIENT_RUN | TASK_PLUGIN_RUN_ASYNC => match decode_task(request) {
                Ok(task) => task_reply(
                    self.tasks
                        .run_and_subscribe_progress(task, Arc::clone(channel), false)
                        .await,
                ),
                Err(reply) => reply,
            },
            AGENT_CLIENT_INSTALL_PACKAGE => {
                let name = request.get_str("name").unwrap_or_default();
                tracing::info!(package = %name, installer = %self.config.plugins.installer, "install package");
                let task = Task::plugin(self.config.plugins.installer.clone(), json!(name));
                task_reply(self.tasks.run(task).await)
            }
            TASK_RUN => match decode_task(request) {
                Ok(task) => task_reply(self.tasks.run(task).await),
                Err(reply) => reply,
            },
            TASK_RUN_ASYNC => match decode_task(request) {
                Ok(task) => match self.tasks.run_async(task).await {
                    Ok(id) => json!({"task_id": id}),
                    Err(e) => json!({"error": e.to_string()}),
                },
                Err(reply) => reply,
            },
            TASK_QUERY => {
                let id = request.get_str("task_id").unwrap_or_default();
                match self.tasks.try_get(id).await {
                    Some(task) => json!({"task": task.to_value()}),
                    None => json!({"error": "task not found"}),
                }
            }
            TASK_SUBSCRIBE_PROGRESS => {
                let id = request.get_str("task_id").unwrap_or_default();
                ok_or_error(self.tasks.subscribe_progress(id, Arc::clone(channel)).await)
            }
            TASK_UPDATE_PROGRESS => {
                let id = request.get_str("task_id").unwrap_or_default();
                let progress = request.get("progress").cloned().unwrap_or(Value::Null);
                let delivered = self.tasks.update_progress(id, &progress).await;
                json!({"ok": delivered})
            }
            other => {
                tracing::warn!(url = %other, channel_id = %channel.id(), "unknown operation");
                json!({"error": "unknown operation"})
            }
        };
        Some(reply)
    }
}

fn decode_plugins(value: Option<&Value>) -> Vec<PluginDescriptor> {
    match value {
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!("invalid plugin list ignored: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}

fn decode_task(request: &Envelope) -> Result<Task, Value> {
    let value = request
        .get("task")
        .cloned()
        .ok_or_else(|| json!({"error": "missing task"}))?;
    Task::from_value(value).map_err(|e| json!({"error": format!("invalid task: {}", e)}))
}

fn task_reply(result: Result<Task, TaskError>) -> Value {
    match result {
        Ok(task) => json!({"task": task.to_value()}),
        Err(e) => json!({"error": e.to_string()}),
    }
}

fn ok_or_error<E: std::fmt::Display>(result: Result<(), E>) -> Value {
    match result {
        Ok(()) => json!({"ok": true}),
        Err(e) => json!({"error": e.to_string()}),
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle_text(&self, channel: Arc<dyn DuplexChannel>, text: String) {
        let request = match Envelope::parse(&text) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(channel_id = %channel.id(), "malformed envelope dropped: {}", e);
                return;
            }
        };

        let Some(payload) = self.route(&channel, &request).await else {
            return;
        };
        let Some(mut reply) = request.reply() else {
            return;
        };
        if let Value::Object(map) = payload {
            reply.payload = map;
        }
        if let Err(e) = channel.send_text(reply.to_text()).await {
            tracing::warn!(channel_id = %channel.id(), url = %request.url, "reply not delivered: {}", e);
        }
    }

    fn in_order(&self, text: &str) -> bool {
        peek_url(text).map_or(true, |url| is_ordered(&url))
    }

    async fn channel_closed(&self, channel_id: &str) {
        let gone = self.agents.exit_channel(channel_id).await;
        if !gone.is_empty() {
            tracing::info!(channel_id = %channel_id, agents = ?gone, "channel closed, agents removed");
        }
    }
}
