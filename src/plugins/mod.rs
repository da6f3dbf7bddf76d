//! 插件系统
//!
//! - `descriptor`：插件描述与清单解析
//! - `registry`：按名称注册、优先级取舍、整体重载
//! - `watcher`：目录监听与去抖重载
//! - `executor`：五种执行策略
//! - `template` / `progress` / `script`：执行器的辅助部件

pub mod descriptor;
pub mod executor;
pub mod progress;
pub mod registry;
pub mod script;
pub mod template;
mod watcher;

pub use descriptor::{is_manifest, parse_manifest, PluginDescriptor, Strategy};
pub use executor::PluginExecutor;
pub use progress::{ProgressTail, ProgressUpdate};
pub use registry::PluginRegistry;
pub use script::{ProcessScriptHost, ScriptHost, ScriptRequest, ScriptRun};

use thiserror::Error;

/// 插件错误
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Invalid manifest {path}: {message}")]
    Manifest { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Plugin timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unsupported plugin type: {0}")]
    UnsupportedType(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Http error: {0}")]
    Http(String),

    #[error("Watch error: {0}")]
    Watch(String),
}
