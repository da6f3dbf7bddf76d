//! 任务：数据模型、命名队列、关联等待表、进度订阅与生命周期管理

pub mod correlation;
pub mod lifecycle;
pub mod model;
pub mod progress;
pub mod queue;

pub use correlation::{CorrelationRegistry, PendingReply};
pub use lifecycle::{LifecycleConfig, TaskHandler, TaskManager};
pub use model::{Processor, ProcessorType, Task, TaskId, TaskStatus, Trace};
pub use progress::ProgressSubscriber;
pub use queue::{QueueSet, DEFAULT_QUEUE};
