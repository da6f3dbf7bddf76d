//! 核心编排层：错误类型、分发状态机、编排根与优雅关闭

pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod shutdown;

pub use dispatch::{DispatchState, Dispatcher, PLUGIN_NOT_FOUND};
pub use error::{AgentError, RelayError, TaskError};
pub use orchestrator::Orchestrator;
pub use shutdown::{
    run_with_graceful_shutdown, AgentsCleanup, RelayCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
