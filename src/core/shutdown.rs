//! 优雅关闭
//!
//! 关闭信号（Ctrl+C / SIGTERM / 致命错误）取消同一个 CancellationToken：
//! 目录监听、Hub 中继的连接与心跳循环、WebSocket / HTTP 服务都在 select! 中监听它。
//! 随后由 `ShutdownCoordinator` 在超时内依次执行清理任务。

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::AgentCollection;
use crate::relay::HubRelay;

/// 关闭信号管理器
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 致命错误（如端口绑定失败）
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 关闭 token（交给各后台循环）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(?reason, "shutdown requested");
        }
        self.shutdown_token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：在超时内依次执行清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }
}

/// 断开全部 Agent（关闭其通道）
pub struct AgentsCleanup {
    agents: Arc<AgentCollection>,
}

impl AgentsCleanup {
    pub fn new(agents: Arc<AgentCollection>) -> Self {
        Self { agents }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AgentsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        for agent in self.agents.list().await {
            self.agents.exit(&agent.id).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Agents"
    }
}

/// 停用 Hub 中继，阻止关闭期间的新转发
pub struct RelayCleanup {
    relay: Arc<HubRelay>,
}

impl RelayCleanup {
    pub fn new(relay: Arc<HubRelay>) -> Self {
        Self { relay }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RelayCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if self.relay.is_enabled() {
            self.relay.set_enabled(false);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HubRelay"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
