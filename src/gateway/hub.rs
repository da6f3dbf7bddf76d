//! WebSocket Hub 服务：接入 Agent 与客户端的双工连接
//!
//! 每条连接包装为 `WsConnection`，文本帧交给编排根路由；连接断开时移除其上注册的 Agent。

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::channel::{MessageHandler, WsConnection};
use crate::core::Orchestrator;

/// WebSocket Hub 服务
pub struct HubServer {
    orchestrator: Arc<Orchestrator>,
    bind_addr: String,
}

impl HubServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let bind_addr = orchestrator.config().server.ws_bind.clone();
        Self {
            orchestrator,
            bind_addr,
        }
    }

    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// 绑定监听地址，返回实际地址（端口为 0 时由系统分配）
    pub async fn bind(&self) -> Result<(TcpListener, SocketAddr), String> {
        let addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local = listener.local_addr().map_err(|e| e.to_string())?;
        Ok((listener, local))
    }

    /// 接受连接直到 token 被取消
    pub async fn serve(&self, listener: TcpListener, token: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Hub listening on ws://{}", addr);
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let handler: Arc<dyn MessageHandler> = Arc::clone(&self.orchestrator) as Arc<dyn MessageHandler>;
                        let token = token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, handler, token).await {
                                tracing::error!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                }
            }
        }
        tracing::info!("hub server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) -> Result<(), String> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(channel_id = %id, peer = %addr, "connection opened");
    WsConnection::new(ws, id.clone()).serve(handler, token).await;
    tracing::debug!(channel_id = %id, peer = %addr, "connection closed");
    Ok(())
}
