//! Hive - 分布式任务分发节点
//!
//! 入口：初始化日志、加载配置、创建编排根，启动插件注册表、WebSocket Hub、HTTP 接口
//! 与（启用时的）Hub 中继，等待 Ctrl+C / SIGTERM 后优雅关闭。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin hive -- config/hive.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{
    run_with_graceful_shutdown, AgentsCleanup, Orchestrator, RelayCleanup, ShutdownCoordinator,
    ShutdownReason,
};
use hive::gateway::{http, HubServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let orchestrator = Orchestrator::new(cfg.clone());
    let shutdown = Arc::clone(orchestrator.shutdown_manager());
    let token = shutdown.token();

    let hub = HubServer::new(Arc::clone(&orchestrator));
    let (ws_listener, _) = hub
        .bind()
        .await
        .map_err(anyhow::Error::msg)
        .context("Failed to bind hub")?;
    let http_listener = tokio::net::TcpListener::bind(&cfg.server.http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.http_bind))?;

    orchestrator.start().await;

    let hub_token = token.clone();
    let hub_task = tokio::spawn(async move { hub.serve(ws_listener, hub_token).await });

    let http_orchestrator = Arc::clone(&orchestrator);
    let http_token = token.clone();
    let http_shutdown = Arc::clone(&shutdown);
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(http_listener, http_orchestrator, http_token).await {
            tracing::error!("HTTP server failed: {}", e);
            http_shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
        }
    });

    tracing::info!("Press Ctrl+C to stop");

    let mut coordinator = ShutdownCoordinator::new().with_timeout(5);
    coordinator.register(RelayCleanup::new(Arc::clone(orchestrator.relay())));
    coordinator.register(AgentsCleanup::new(Arc::clone(orchestrator.agents())));

    run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        async move {
            let _ = tokio::join!(hub_task, http_task);
        },
        move || async move {
            orchestrator.shutdown();
            coordinator.run_cleanup().await;
        },
    )
    .await;

    tracing::info!("hive stopped");
    Ok(())
}
