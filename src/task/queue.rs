//! 命名队列：有界并发的执行域
//!
//! 每个队列一个工作循环：按 FIFO 取出作业，先拿 Semaphore 许可再派生执行，
//! 因此准入顺序为 FIFO，完成顺序不保证。并发上限在队列首次创建时确定，之后不再修改。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Semaphore};

/// 默认队列（无并发上限）
pub const DEFAULT_QUEUE: &str = "main";

/// 队列作业
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct NamedQueue {
    tx: mpsc::UnboundedSender<Job>,
    limit: Option<usize>,
}

/// 命名队列集合
#[derive(Default)]
pub struct QueueSet {
    queues: Mutex<HashMap<String, NamedQueue>>,
}

impl QueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NamedQueue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 投递作业；队列不存在时以 `limit` 创建（`main` 恒为无上限）
    pub fn enqueue(&self, name: &str, limit: Option<usize>, job: Job) {
        let mut queues = self.lock();
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            let limit = if name == DEFAULT_QUEUE { None } else { limit };
            tracing::debug!(queue = %name, ?limit, "queue created");
            NamedQueue {
                tx: spawn_worker(name.to_string(), limit),
                limit,
            }
        });
        if let Err(e) = queue.tx.send(job) {
            tracing::error!(queue = %name, "queue worker gone: {}", e);
        }
    }

    /// 队列的并发上限；队列不存在时返回 None
    pub fn limit(&self, name: &str) -> Option<Option<usize>> {
        self.lock().get(name).map(|q| q.limit)
    }

    /// 已创建的队列名（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

fn spawn_worker(name: String, limit: Option<usize>) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let semaphore = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match &semaphore {
                Some(semaphore) => {
                    let permit = match Arc::clone(semaphore).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    tokio::spawn(async move {
                        let _permit = permit;
                        job.await;
                    });
                }
                None => {
                    tokio::spawn(job);
                }
            }
        }
        tracing::debug!(queue = %name, "queue worker stopped");
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let queues = QueueSet::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..10 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let done_tx = done_tx.clone();
            queues.enqueue(
                "render",
                Some(2),
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                }),
            );
        }

        for _ in 0..10 {
            done_rx.recv().await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_limit_wins() {
        let queues = QueueSet::new();
        queues.enqueue("q", Some(3), Box::pin(async {}));
        queues.enqueue("q", Some(7), Box::pin(async {}));
        assert_eq!(queues.limit("q"), Some(Some(3)));
    }

    #[tokio::test]
    async fn test_main_queue_is_unbounded() {
        let queues = QueueSet::new();
        queues.enqueue(DEFAULT_QUEUE, Some(1), Box::pin(async {}));
        assert_eq!(queues.limit(DEFAULT_QUEUE), Some(None));
    }

    #[tokio::test]
    async fn test_single_slot_queue_admits_in_order() {
        let queues = QueueSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            let tx = tx.clone();
            queues.enqueue(
                "serial",
                Some(1),
                Box::pin(async move {
                    let _ = tx.send(i);
                }),
            );
        }
        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
