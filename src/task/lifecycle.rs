//! 任务生命周期管理
//!
//! 提交：分配 ID → 登记关联等待 → 按插件描述选队列 → 入队；
//! 执行：工作循环取出任务交给 `TaskHandler`（分发状态机），无论成功、失败还是 panic 都恰好调用一次 `complete_task`；
//! 完成：判定状态、解析等待方、关闭进度订阅、在保留期后从缓存移除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::correlation::{CorrelationRegistry, PendingReply};
use super::model::{Task, TaskId, TaskStatus};
use super::progress::ProgressSubscriber;
use super::queue::{QueueSet, DEFAULT_QUEUE};
use crate::channel::DuplexChannel;
use crate::core::TaskError;
use crate::plugins::{PluginRegistry, ProgressUpdate};

/// 完成任务在缓存中的默认保留时长
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

/// 等待任务完成的默认超时
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// 任务处理者：为出队的任务选择并运行执行方，结果写回任务
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &mut Task);
}

/// 生命周期参数
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub retention: Duration,
    pub reply_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// 完成前的进度冲刷请求：进度泵处理完先前入队的进度后应答
struct FlushRequest {
    task_id: TaskId,
    done: oneshot::Sender<()>,
}

/// 任务生命周期管理器
pub struct TaskManager {
    handler: Arc<dyn TaskHandler>,
    plugins: Arc<PluginRegistry>,
    correlations: Arc<CorrelationRegistry>,
    queues: QueueSet,
    tasks: RwLock<HashMap<TaskId, Task>>,
    subscribers: Mutex<HashMap<TaskId, ProgressSubscriber>>,
    running: AtomicUsize,
    config: LifecycleConfig,
    flush: std::sync::Mutex<Option<mpsc::UnboundedSender<FlushRequest>>>,
}

impl TaskManager {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        plugins: Arc<PluginRegistry>,
        correlations: Arc<CorrelationRegistry>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            plugins,
            correlations,
            queues: QueueSet::new(),
            tasks: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            config,
            flush: std::sync::Mutex::new(None),
        })
    }

    /// 提交并等待完成
    pub async fn run(self: &Arc<Self>, task: Task) -> Result<Task, TaskError> {
        let (_, pending) = self.submit(task, None).await?;
        self.await_completion(pending).await
    }

    /// 提交后立即返回任务 ID；完成结果可经 `try_get` 查询
    pub async fn run_async(self: &Arc<Self>, task: Task) -> Result<TaskId, TaskError> {
        let (id, pending) = self.submit(task, None).await?;
        let timeout = self.config.reply_timeout;
        // 持有等待句柄直到完成，任务在此期间视为在途，可被订阅进度
        tokio::spawn(async move {
            if let Err(e) = pending.wait(timeout).await {
                tracing::warn!("async task wait ended: {}", e);
            }
        });
        Ok(id)
    }

    /// 先为任务登记进度订阅，再提交并等待完成
    pub async fn run_and_subscribe_progress(
        self: &Arc<Self>,
        task: Task,
        channel: Arc<dyn DuplexChannel>,
        close_on_complete: bool,
    ) -> Result<Task, TaskError> {
        let (_, pending) = self.submit(task, Some((channel, close_on_complete))).await?;
        self.await_completion(pending).await
    }

    async fn await_completion(&self, pending: PendingReply) -> Result<Task, TaskError> {
        let value = pending.wait(self.config.reply_timeout).await?;
        Task::from_value(value).map_err(|e| TaskError::Decode(e.to_string()))
    }

    async fn submit(
        self: &Arc<Self>,
        mut task: Task,
        subscriber: Option<(Arc<dyn DuplexChannel>, bool)>,
    ) -> Result<(TaskId, PendingReply), TaskError> {
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        task.status = TaskStatus::Pending;
        task.output = None;
        task.completed_at = None;
        task.created_at = Some(chrono::Utc::now().timestamp_millis());

        let id = task.id.clone();
        let pending = self.correlations.register(&id)?;

        if let Some((channel, close_on_complete)) = subscriber {
            self.subscribers
                .lock()
                .await
                .insert(id.clone(), ProgressSubscriber::new(id.clone(), channel, close_on_complete));
        }

        let (queue, limit) = match self.plugins.try_get_plugin(task.capability()).await {
            Some(descriptor) => (descriptor.queue_name(), descriptor.concurrency()),
            None => (DEFAULT_QUEUE.to_string(), None),
        };
        tracing::debug!(task_id = %id, queue = %queue, ?limit, "task queued");

        self.tasks.write().await.insert(id.clone(), task);

        let manager = Arc::clone(self);
        let task_id = id.clone();
        self.queues
            .enqueue(&queue, limit, Box::pin(async move { manager.execute(task_id).await }));

        Ok((id, pending))
    }

    async fn execute(self: Arc<Self>, id: TaskId) {
        let task = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&id) {
                Some(task) => {
                    task.status = TaskStatus::Running;
                    task.clone()
                }
                None => {
                    tracing::warn!(task_id = %id, "queued task vanished before execution");
                    return;
                }
            }
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::clone(&self.handler);
        let fallback = task.clone();
        let outcome = tokio::spawn(async move {
            let mut task = task;
            handler.handle(&mut task).await;
            task
        })
        .await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let task = match outcome {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id = %id, "task handler aborted: {}", e);
                let mut task = fallback;
                task.output = None;
                task.trace.error(format!("dispatch aborted: {}", e));
                task
            }
        };
        self.complete_task(task).await;
    }

    /// 标记完成：Output 为空（或 null）视为失败；先送达已产生的进度并关闭订阅，再解析等待方
    pub async fn complete_task(self: &Arc<Self>, mut task: Task) {
        let succeeded = task.output.as_ref().map(|v| !v.is_null()).unwrap_or(false);
        task.status = if succeeded { TaskStatus::Completed } else { TaskStatus::Failed };
        task.trace.success = succeeded;
        if !succeeded && task.trace.message.is_none() {
            task.trace.error("no output");
        }
        let completed_at = chrono::Utc::now().timestamp_millis();
        task.completed_at = Some(completed_at);

        let id = task.id.clone();
        self.flush_progress(&id).await;
        let subscriber = self.subscribers.lock().await.remove(&id);
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }

        let value = task.to_value();
        tracing::info!(task_id = %id, status = ?task.status, "task completed");
        self.tasks.write().await.insert(id.clone(), task);
        self.correlations.complete(&id, value);

        self.schedule_eviction(id, completed_at);
    }

    /// 等待进度泵处理完此前入队的进度（未启动进度泵时立即返回）
    async fn flush_progress(&self, id: &str) {
        let flush = self.flush.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(flush) = flush else { return };
        let (done, ack) = oneshot::channel();
        let request = FlushRequest {
            task_id: id.to_string(),
            done,
        };
        if flush.send(request).is_ok() {
            let _ = ack.await;
        }
    }

    fn schedule_eviction(self: &Arc<Self>, id: TaskId, completed_at: i64) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let retention = self.config.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(manager) = manager.upgrade() {
                let mut tasks = manager.tasks.write().await;
                // 同一 ID 若已被重新提交，则保留新任务
                let expired = tasks
                    .get(&id)
                    .map(|t| t.is_finished() && t.completed_at == Some(completed_at))
                    .unwrap_or(false);
                if expired {
                    tasks.remove(&id);
                    tracing::debug!(task_id = %id, "task evicted");
                }
            }
        });
    }

    /// 向任务的进度订阅者推送一条进度；未送达返回 false
    pub async fn update_progress(&self, id: &str, progress: &Value) -> bool {
        if !self.tasks.read().await.contains_key(id) {
            return false;
        }
        let subscribers = self.subscribers.lock().await;
        match subscribers.get(id) {
            Some(subscriber) => subscriber.send(progress).await,
            None => false,
        }
    }

    /// 订阅在途任务的进度；完成时连带关闭通道
    pub async fn subscribe_progress(&self, id: &str, channel: Arc<dyn DuplexChannel>) -> Result<(), TaskError> {
        if !self.correlations.contains(id) {
            return Err(TaskError::NotInFlight(id.to_string()));
        }
        self.subscribers
            .lock()
            .await
            .insert(id.to_string(), ProgressSubscriber::new(id, channel, true));
        Ok(())
    }

    pub async fn try_get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// 正在执行的任务数
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// 把执行器产生的进度转发给订阅者
    ///
    /// 进度与完成前的冲刷请求在同一循环中处理，进度优先：冲刷应答时该任务此前的进度都已送达。
    pub fn pump_progress(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) -> JoinHandle<()> {
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<FlushRequest>();
        *self.flush.lock().unwrap_or_else(|e| e.into_inner()) = Some(flush_tx);

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut updates_open = true;
            loop {
                tokio::select! {
                    biased;
                    update = rx.recv(), if updates_open => match update {
                        Some(update) => {
                            let Some(manager) = manager.upgrade() else { break };
                            if !manager.update_progress(&update.task_id, &update.progress).await {
                                tracing::trace!(task_id = %update.task_id, "progress without subscriber dropped");
                            }
                        }
                        None => updates_open = false,
                    },
                    request = flush_rx.recv() => match request {
                        Some(request) => {
                            tracing::trace!(task_id = %request.task_id, "progress flushed");
                            let _ = request.done.send(());
                        }
                        None => break,
                    },
                }
            }
        })
    }
}
