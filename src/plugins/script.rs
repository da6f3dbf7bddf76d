//! 脚本宿主
//!
//! typesharp 插件不直接起 shell，而是交给注入的 `ScriptHost` 运行。
//! 默认实现 `ProcessScriptHost` 以 `<interpreter> <script> <input> <output> <logger> <progress>` 启动子进程，
//! 句柄丢弃时子进程被终止。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::PluginError;

/// 输出文件释放检查：间隔与次数
pub const FILE_RELEASE_POLL: Duration = Duration::from_millis(10);
pub const FILE_RELEASE_ATTEMPTS: u32 = 100;

/// 一次脚本运行请求
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub logger: PathBuf,
    pub progress: PathBuf,
}

/// 运行中的脚本；丢弃即终止
#[async_trait]
pub trait ScriptRun: Send {
    /// 等待脚本结束；非正常结束返回错误
    async fn wait(&mut self) -> Result<(), PluginError>;
}

/// 「运行程序」能力
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn run_program(&self, request: ScriptRequest) -> Result<Box<dyn ScriptRun>, PluginError>;
}

/// 以子进程运行脚本
#[derive(Debug, Clone, Default)]
pub struct ProcessScriptHost {
    interpreter: Option<String>,
}

impl ProcessScriptHost {
    /// `interpreter` 为空时直接执行脚本文件
    pub fn new(interpreter: Option<String>) -> Self {
        Self {
            interpreter: interpreter.filter(|s| !s.trim().is_empty()),
        }
    }
}

struct ProcessRun {
    child: Child,
}

#[async_trait]
impl ScriptRun for ProcessRun {
    async fn wait(&mut self) -> Result<(), PluginError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| PluginError::Script(format!("wait failed: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(PluginError::Script(format!("exit {:?}", status.code())))
        }
    }
}

#[async_trait]
impl ScriptHost for ProcessScriptHost {
    async fn run_program(&self, request: ScriptRequest) -> Result<Box<dyn ScriptRun>, PluginError> {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&request.script);
                c
            }
            None => Command::new(&request.script),
        };
        let child = cmd
            .args([&request.input, &request.output, &request.logger, &request.progress])
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Spawn(format!("script {}: {}", request.script.display(), e)))?;
        tracing::debug!(script = %request.script.display(), "script started");
        Ok(Box::new(ProcessRun { child }))
    }
}

/// 等待文件可被读写打开（写入方已释放）；超出次数返回 false
pub async fn wait_file_released(path: &Path) -> bool {
    for _ in 0..FILE_RELEASE_ATTEMPTS {
        if std::fs::OpenOptions::new().read(true).write(true).open(path).is_ok() {
            return true;
        }
        tokio::time::sleep(FILE_RELEASE_POLL).await;
    }
    false
}
