//! Hive - Rust 分布式任务分发引擎
//!
//! 模块划分：
//! - **agents**: 远程 Agent、Agent 注册表与性能快照
//! - **channel**: 双工通道抽象（WebSocket / 内存）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、分发状态机、编排根、优雅关闭
//! - **gateway**: WebSocket Hub 与 HTTP 接口
//! - **plugins**: 插件描述、注册表（热加载）与执行器
//! - **protocol**: 通道信封与端点常量
//! - **relay**: 作为 Agent 接入上游 Hub
//! - **task**: 任务模型、命名队列、关联等待与生命周期

pub mod agents;
pub mod channel;
pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod plugins;
pub mod protocol;
pub mod relay;
pub mod task;

pub use crate::core::{Orchestrator, PLUGIN_NOT_FOUND};
pub use crate::task::{Task, TaskStatus};
