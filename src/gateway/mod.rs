//! 边界服务
//!
//! - **Hub**：WebSocket 双工通道，Agent 注册、回复、进度与任务请求都经此进入编排根
//! - **HTTP**：同步 / 异步提交与查询，Hub 中继的同步 `Run` 也调用这里的 `/task/run`

pub mod http;
mod hub;

pub use hub::HubServer;
