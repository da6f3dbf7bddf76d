//! Hub 中继（本节点作为 Agent 接入上游 Hub）
//!
//! - 连接循环：未启用时每 `reconnect_secs` 轮询；启用后连接 Hub，后台注册本机插件，
//!   随后服务入站消息直到断开，等待后重连
//! - 心跳循环：启用且已连接时每 `heartbeat_secs` 上报性能快照
//! - 插件循环：注册表重载后推送新的插件列表
//! - `run`：经 Hub 的 HTTP 同步接口转发任务

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::agents::{host_name, PerformanceSampler};
use crate::channel::{DuplexChannel, MessageHandler, WsChannel, WsConnection};
use crate::config::RelaySection;
use crate::core::RelayError;
use crate::plugins::{PluginDescriptor, PluginRegistry};
use crate::protocol::{Envelope, AGENT_REGISTER, AGENT_UPDATE_PERFORMANCE, AGENT_UPDATE_PLUGINS};
use crate::task::{CorrelationRegistry, Task};

/// 同步转发任务的超时
const RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// 正在执行的任务数（心跳上报用）
pub type RunningCounter = Arc<dyn Fn() -> usize + Send + Sync>;

/// Hub 中继客户端
pub struct HubRelay {
    config: RelaySection,
    agent_id: String,
    http_url: Option<String>,
    enabled: AtomicBool,
    channel: RwLock<Option<Arc<WsChannel>>>,
    plugins: Arc<PluginRegistry>,
    correlations: Arc<CorrelationRegistry>,
    sampler: PerformanceSampler,
    http: reqwest::Client,
}

impl HubRelay {
    pub fn new(config: RelaySection, plugins: Arc<PluginRegistry>, correlations: Arc<CorrelationRegistry>) -> Self {
        let agent_id = config
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            http_url: config.http_url(),
            enabled: AtomicBool::new(config.enabled),
            agent_id,
            config,
            channel: RwLock::new(None),
            plugins,
            correlations,
            sampler: PerformanceSampler::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn http_url(&self) -> Option<&str> {
        self.http_url.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "hub relay toggled");
    }

    pub fn is_connected(&self) -> bool {
        self.current_channel().map(|c| c.is_open()).unwrap_or(false)
    }

    fn current_channel(&self) -> Option<Arc<WsChannel>> {
        self.channel.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_channel(&self, channel: Option<Arc<WsChannel>>) {
        *self.channel.write().unwrap_or_else(|e| e.into_inner()) = channel;
    }

    /// 启动连接、心跳与插件推送循环
    pub fn start(self: &Arc<Self>, handler: Arc<dyn MessageHandler>, running: RunningCounter, token: CancellationToken) {
        let relay = Arc::clone(self);
        let connect_token = token.clone();
        tokio::spawn(async move { relay.connect_loop(handler, connect_token).await });

        let relay = Arc::clone(self);
        let heartbeat_token = token.clone();
        tokio::spawn(async move { relay.heartbeat_loop(running, heartbeat_token).await });

        let relay = Arc::clone(self);
        tokio::spawn(async move { relay.plugin_loop(token).await });
    }

    async fn connect_loop(self: Arc<Self>, handler: Arc<dyn MessageHandler>, token: CancellationToken) {
        let reconnect = Duration::from_secs(self.config.reconnect_secs);
        while !token.is_cancelled() {
            if self.is_enabled() {
                match self.connect().await {
                    Ok(connection) => {
                        tracing::info!(hub = %self.config.hub_url, agent_id = %self.agent_id, "connected to hub");
                        self.set_channel(Some(connection.channel()));

                        let relay = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = relay.register().await {
                                tracing::error!("hub register failed: {}", e);
                            }
                        });

                        connection.serve(Arc::clone(&handler), token.clone()).await;
                        self.set_channel(None);
                        tracing::warn!(hub = %self.config.hub_url, "hub connection closed");
                    }
                    Err(e) => tracing::warn!(hub = %self.config.hub_url, "{}", e),
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(reconnect) => {}
            }
        }
        tracing::info!("hub relay connect loop stopped");
    }

    async fn connect(&self) -> Result<WsConnection<MaybeTlsStream<TcpStream>>, RelayError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.hub_url.as_str())
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        Ok(WsConnection::new(ws, format!("hub-{}", uuid::Uuid::new_v4())))
    }

    async fn heartbeat_loop(self: Arc<Self>, running: RunningCounter, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_enabled() && self.is_connected() {
                        if let Err(e) = self.heartbeat(running()).await {
                            tracing::warn!("hub heartbeat failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn plugin_loop(self: Arc<Self>, token: CancellationToken) {
        let mut generation = self.plugins.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = generation.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.is_enabled() && self.is_connected() {
                        let plugins = self.local_plugins().await;
                        if let Err(e) = self.update(plugins).await {
                            tracing::warn!("hub plugin update failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn local_plugins(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .get_plugins()
            .await
            .iter()
            .map(|d| d.as_ref().clone())
            .collect()
    }

    /// 经当前连接发送请求并等待回复
    async fn request(&self, envelope: impl FnOnce(&str) -> Envelope) -> Result<Value, RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Disabled);
        }
        let channel = self.current_channel().ok_or(RelayError::NotConnected)?;
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let pending = self.correlations.register(&correlation_id)?;
        channel
            .send_text(envelope(&correlation_id).to_text())
            .await
            .map_err(RelayError::Send)?;
        Ok(pending
            .wait(Duration::from_secs(self.config.reply_timeout_secs))
            .await?)
    }

    /// 向 Hub 注册本机插件列表
    pub async fn register(&self) -> Result<Value, RelayError> {
        let plugins = serde_json::to_value(self.local_plugins().await).unwrap_or(Value::Null);
        let reply = self
            .request(|cid| {
                Envelope::request(AGENT_REGISTER, cid)
                    .with("agent_id", self.agent_id.as_str())
                    .with("host_name", host_name())
                    .with("plugins", plugins)
            })
            .await?;
        tracing::info!(agent_id = %self.agent_id, "registered with hub");
        Ok(reply)
    }

    /// 上报性能快照
    pub async fn heartbeat(&self, running_tasks: usize) -> Result<Value, RelayError> {
        let performance = serde_json::to_value(self.sampler.sample(running_tasks)).unwrap_or(Value::Null);
        self.request(|cid| {
            Envelope::request(AGENT_UPDATE_PERFORMANCE, cid)
                .with("agent_id", self.agent_id.as_str())
                .with("performance", performance)
        })
        .await
    }

    /// 推送插件列表变更
    pub async fn update(&self, plugins: Vec<PluginDescriptor>) -> Result<Value, RelayError> {
        let plugins = serde_json::to_value(plugins).unwrap_or(Value::Null);
        self.request(|cid| {
            Envelope::request(AGENT_UPDATE_PLUGINS, cid)
                .with("agent_id", self.agent_id.as_str())
                .with("plugins", plugins)
        })
        .await
    }

    /// 经 Hub 的同步运行接口转发任务，拷回 Output 与 Trace
    pub async fn run(&self, task: &mut Task) -> Result<(), RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Disabled);
        }
        let base = self.http_url.as_deref().ok_or(RelayError::NoHttpUrl)?;
        let url = format!("{}/task/run", base);
        tracing::debug!(task_id = %task.id, url = %url, "relay task to hub");
        let response = self
            .http
            .post(&url)
            .timeout(RUN_TIMEOUT)
            .json(&task.to_value())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Http(e.to_string()))?;
        let remote: Task = response.json().await.map_err(|e| RelayError::Http(e.to_string()))?;
        task.absorb(remote);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    fn relay(enabled: bool, hub_http_url: Option<String>) -> HubRelay {
        let config = RelaySection {
            enabled,
            hub_http_url,
            agent_id: Some("node-1".into()),
            ..Default::default()
        };
        HubRelay::new(
            config,
            Arc::new(PluginRegistry::new("unused")),
            Arc::new(CorrelationRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_disabled_relay_refuses() {
        let relay = relay(false, None);
        assert_eq!(relay.agent_id(), "node-1");
        let mut task = Task::plugin("x", json!(1));
        assert!(matches!(relay.run(&mut task).await, Err(RelayError::Disabled)));
        assert!(matches!(relay.register().await, Err(RelayError::Disabled)));
    }

    #[tokio::test]
    async fn test_requests_need_connection() {
        let relay = relay(true, None);
        assert!(!relay.is_connected());
        assert!(matches!(relay.heartbeat(0).await, Err(RelayError::NotConnected)));
        let mut task = Task::plugin("x", json!(1));
        assert!(matches!(relay.run(&mut task).await, Err(RelayError::NoHttpUrl)));
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let relay = HubRelay::new(
            RelaySection {
                enabled: true,
                hub_url: format!("ws://{}", addr),
                ..Default::default()
            },
            Arc::new(PluginRegistry::new("unused")),
            Arc::new(CorrelationRegistry::new()),
        );
        assert!(matches!(relay.connect().await, Err(RelayError::Connect(_))));
    }

    #[tokio::test]
    async fn test_run_posts_to_hub() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/task/run",
            post(|Json(mut task): Json<Task>| async move {
                task.output = Some(json!({"relayed": task.input.clone()}));
                task.trace.log("hub ran");
                Json(task)
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let relay = relay(true, Some(format!("http://{}", addr)));
        let mut task = Task::plugin("far", json!(5)).with_id("r1");
        relay.run(&mut task).await.unwrap();
        assert_eq!(task.output, Some(json!({"relayed": 5})));
        assert_eq!(task.trace.logs, vec!["hub ran".to_string()]);
    }
}
