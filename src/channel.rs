//! 双工通道抽象
//!
//! Agent、Hub 中继与进度订阅都只依赖 `DuplexChannel`：发送文本帧、关闭、查询是否存活。
//! `WsChannel` 把帧投递到 WebSocket 写半部的转发任务（与 Hub 连接的 tx 模式一致）；
//! `MemoryChannel` 用于测试与进程内回环。
//! `WsConnection` 把一条 WebSocket 连接拆成读循环与写任务，服务端与 Hub 中继共用。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// 双工通道 trait
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// 通道唯一标识（用于判断重注册时是否换了连接）
    fn id(&self) -> &str;

    /// 发送一个文本帧
    async fn send_text(&self, text: String) -> Result<(), String>;

    /// 关闭通道（幂等）
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// WebSocket 通道：帧经 mpsc 交给连接的写任务
pub struct WsChannel {
    id: String,
    tx: mpsc::UnboundedSender<WsMessage>,
    open: AtomicBool,
}

impl WsChannel {
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            tx,
            open: AtomicBool::new(true),
        }
    }

    /// 连接读半部结束时调用：只标记关闭，不再发送 Close 帧
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DuplexChannel for WsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(&self, text: String) -> Result<(), String> {
        if !self.is_open() {
            return Err(format!("channel {} closed", self.id));
        }
        self.tx.send(WsMessage::Text(text)).map_err(|e| {
            self.mark_closed();
            format!("Send error: {}", e)
        })
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(WsMessage::Close(None));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// 入站消息处理者
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理一个入站文本帧；回复经同一通道发送
    async fn handle_text(&self, channel: Arc<dyn DuplexChannel>, text: String);

    /// 该帧是否在读循环内按到达顺序处理；返回 false 的帧派生独立任务
    fn in_order(&self, _text: &str) -> bool {
        false
    }

    /// 通道断开
    async fn channel_closed(&self, channel_id: &str);
}

/// 一条 WebSocket 连接：写半部由独立任务驱动，读半部由 `serve` 循环
pub struct WsConnection<S> {
    channel: Arc<WsChannel>,
    reader: SplitStream<WebSocketStream<S>>,
    writer: JoinHandle<()>,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, id: impl Into<String>) -> Self {
        let (mut ws_tx, reader) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        Self {
            channel: Arc::new(WsChannel::new(id, tx)),
            reader,
            writer,
        }
    }

    pub fn channel(&self) -> Arc<WsChannel> {
        Arc::clone(&self.channel)
    }

    /// 读循环：有序帧就地处理，其余帧派生独立任务（长任务不阻塞后续帧的读取），连接结束后通知处理者
    pub async fn serve(mut self, handler: Arc<dyn MessageHandler>, token: CancellationToken) {
        let channel: Arc<dyn DuplexChannel> = self.channel.clone();
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    self.channel.close().await;
                    // 给写任务一点时间发出 Close 帧
                    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut self.writer).await;
                    break;
                }
                msg = self.reader.next() => msg,
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) if handler.in_order(&text) => {
                    handler.handle_text(Arc::clone(&channel), text).await;
                }
                Some(Ok(WsMessage::Text(text))) => {
                    let handler = Arc::clone(&handler);
                    let channel = Arc::clone(&channel);
                    tokio::spawn(async move { handler.handle_text(channel, text).await });
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!(channel = %self.channel.id(), "WebSocket receive error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
        self.channel.mark_closed();
        self.writer.abort();
        handler.channel_closed(self.channel.id()).await;
    }
}

/// 内存通道：发送的帧进入接收端，可配置为发送失败
pub struct MemoryChannel {
    id: String,
    tx: mpsc::UnboundedSender<String>,
    open: AtomicBool,
    fail_sends: AtomicBool,
}

impl MemoryChannel {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: id.into(),
                tx,
                open: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// 之后的 send_text 全部失败（模拟断线）
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(&self, text: String) -> Result<(), String> {
        if self.fail_sends.load(Ordering::SeqCst) || !self.is_open() {
            return Err(format!("channel {} unavailable", self.id));
        }
        self.tx.send(text).map_err(|e| format!("Send error: {}", e))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ws_channel_close_sends_close_frame_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ch = WsChannel::new("c1", tx);
        ch.send_text("hello".into()).await.unwrap();
        ch.close().await;
        ch.close().await;
        assert!(!ch.is_open());
        assert!(ch.send_text("late".into()).await.is_err());

        assert!(matches!(rx.recv().await, Some(WsMessage::Text(t)) if t == "hello"));
        assert!(matches!(rx.recv().await, Some(WsMessage::Close(None))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_channel_failure_mode() {
        let (ch, mut rx) = MemoryChannel::new("m");
        ch.send_text("a".into()).await.unwrap();
        ch.fail_sends();
        assert!(ch.send_text("b".into()).await.is_err());
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
    }
}
