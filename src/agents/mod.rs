//! 远程 Agent 与 Agent 注册表

pub mod agent;
pub mod collection;
pub mod performance;

pub use agent::{Agent, AgentInfo};
pub use collection::AgentCollection;
pub use performance::{host_name, Performance, PerformanceSampler};
