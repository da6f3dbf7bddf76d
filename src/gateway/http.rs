//! HTTP 接口（axum）
//!
//! - POST /task/run           同步运行，返回完成后的任务
//! - POST /task/run/async     入队，返回 `{task_id}`
//! - GET  /task/query/:id     保留期内查询任务
//! - GET  /agent/list         Agent 快照
//! - GET  /plugin/list        本地插件
//! - GET  /health

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use crate::task::Task;

/// 构建路由
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/task/run", post(run_task))
        .route("/task/run/async", post(run_task_async))
        .route("/task/query/:id", get(query_task))
        .route("/agent/list", get(list_agents))
        .route("/plugin/list", get(list_plugins))
        .route("/health", get(health))
        .with_state(orchestrator)
}

/// 在 listener 上服务直到 token 被取消
pub async fn serve(listener: TcpListener, orchestrator: Arc<Orchestrator>, token: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("HTTP listening on http://{}", addr);
    }
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn run_task(State(orchestrator): State<Arc<Orchestrator>>, Json(task): Json<Task>) -> impl IntoResponse {
    match orchestrator.run(task).await {
        Ok(task) => (StatusCode::OK, Json(task.to_value())),
        Err(e) => {
            tracing::error!("task run failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
        }
    }
}

async fn run_task_async(State(orchestrator): State<Arc<Orchestrator>>, Json(task): Json<Task>) -> impl IntoResponse {
    match orchestrator.run_async(task).await {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({"task_id": id}))),
        Err(e) => (StatusCode::CONFLICT, Json(json!({"error": e.to_string()}))),
    }
}

async fn query_task(State(orchestrator): State<Arc<Orchestrator>>, Path(id): Path<String>) -> impl IntoResponse {
    match orchestrator.query(&id).await {
        Some(task) => (StatusCode::OK, Json(task.to_value())),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "task not found"}))),
    }
}

async fn list_agents(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(json!({"agents": orchestrator.agents().list().await}))
}

async fn list_plugins(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let plugins: Vec<_> = orchestrator
        .plugins()
        .get_plugins()
        .await
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();
    Json(json!({"plugins": plugins}))
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "running_tasks": orchestrator.tasks().running_count(),
        "agents": orchestrator.agents().len().await,
        "queues": orchestrator.tasks().queues().names(),
        "relay_connected": orchestrator.relay().is_connected(),
    }))
}
