//! 插件执行器
//!
//! 按描述的 Type 选择策略：commandline / fileread / filewrite / httpget / typesharp(-progress)。
//! 执行失败不向外抛出，统一写入任务 Trace；每次执行输出一行 JSON 审计日志。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::descriptor::{PluginDescriptor, Strategy};
use super::progress::{ProgressTail, ProgressUpdate};
use super::script::{wait_file_released, ScriptHost, ScriptRequest};
use super::template::{references_progress, render_command, resolve_path, InvocationFiles};
use super::PluginError;
use crate::task::Task;

/// commandline 最大尝试次数
pub const MAX_ATTEMPTS: u32 = 3;

/// 唯一可重试的退出码
const RETRYABLE_EXIT_CODE: i32 = 1;

enum OutputFile {
    Valid(Value),
    Invalid(String),
    Missing,
}

/// 插件执行器
pub struct PluginExecutor {
    server_url: String,
    http: reqwest::Client,
    script_host: Arc<dyn ScriptHost>,
    progress: mpsc::UnboundedSender<ProgressUpdate>,
}

impl PluginExecutor {
    /// `server_url` 用于 `{Server}` 占位符；进度经 `progress` 交给生命周期管理器
    pub fn new(
        server_url: impl Into<String>,
        script_host: Arc<dyn ScriptHost>,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            http: reqwest::Client::new(),
            script_host,
            progress,
        }
    }

    /// 执行插件，结果写入 `task.output`，失败写入 `task.trace`
    pub async fn run(&self, descriptor: &PluginDescriptor, task: &mut Task) {
        let start = Instant::now();
        let strategy = descriptor.strategy();

        let result = match &strategy {
            Strategy::CommandLine => self.run_command_line(descriptor, task).await,
            Strategy::FileRead => self.run_file_read(descriptor, task).await,
            Strategy::FileWrite => self.run_file_write(descriptor, task).await,
            Strategy::HttpGet => self.run_http_get(descriptor, task).await,
            Strategy::Script => self.run_script(descriptor, task, false).await,
            Strategy::ScriptWithProgress => self.run_script(descriptor, task, true).await,
            Strategy::Unknown(kind) => Err(PluginError::UnsupportedType(kind.clone())),
        };

        let audit = serde_json::json!({
            "event": "plugin_audit",
            "plugin": descriptor.name,
            "strategy": format!("{:?}", strategy),
            "task_id": task.id,
            "ok": result.is_ok(),
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "plugin");

        if let Err(e) = result {
            tracing::warn!(task_id = %task.id, plugin = %descriptor.name, "plugin failed: {}", e);
            task.trace.error(e.to_string());
        }
    }

    async fn prepare_files(&self, task: &Task) -> Result<(tempfile::TempDir, InvocationFiles), PluginError> {
        let workdir = tempfile::Builder::new().prefix("hive-").tempdir()?;
        let files = InvocationFiles::in_dir(workdir.path());
        let input = serde_json::to_vec(&task.input)
            .map_err(|e| PluginError::ExecutionFailed(format!("encode input: {}", e)))?;
        tokio::fs::write(&files.input, input).await?;
        Ok((workdir, files))
    }

    fn start_tail(&self, enabled: bool, files: &InvocationFiles, task: &Task) -> Option<ProgressTail> {
        enabled.then(|| ProgressTail::spawn(files.progress.clone(), task.id.clone(), self.progress.clone()))
    }

    async fn run_command_line(&self, d: &PluginDescriptor, task: &mut Task) -> Result<(), PluginError> {
        let (workdir, files) = self.prepare_files(task).await?;
        let command = render_command(&d.entry, &d.dir, &files, &self.server_url);
        let cwd = if d.dir.is_dir() { d.dir.clone() } else { workdir.path().to_path_buf() };

        let tail = self.start_tail(references_progress(&d.entry), &files, task);
        let result = self.command_attempts(d, task, &command, &cwd, &files).await;
        if let Some(tail) = tail {
            tail.finish().await;
        }
        result
    }

    async fn command_attempts(
        &self,
        d: &PluginDescriptor,
        task: &mut Task,
        command: &str,
        cwd: &Path,
        files: &InvocationFiles,
    ) -> Result<(), PluginError> {
        for attempt in 1..=MAX_ATTEMPTS {
            tracing::debug!(task_id = %task.id, plugin = %d.name, attempt, "spawn plugin command");
            let code = spawn_shell(command, cwd, d).await?;

            match read_output(&files.output).await {
                OutputFile::Valid(value) => {
                    task.output = Some(value).filter(|v| !v.is_null());
                    task.trace.extend(read_logger(&files.logger).await);
                    return Ok(());
                }
                OutputFile::Invalid(reason) => {
                    task.trace.extend(read_logger(&files.logger).await);
                    return Err(PluginError::InvalidOutput(reason));
                }
                OutputFile::Missing if code == Some(0) => {
                    task.trace.extend(read_logger(&files.logger).await);
                    return Err(PluginError::ExecutionFailed("exit code 0 but no output".to_string()));
                }
                OutputFile::Missing if attempt == MAX_ATTEMPTS => {
                    task.trace.extend(read_logger(&files.logger).await);
                    return Err(PluginError::ExecutionFailed(format!(
                        "no output after {} attempts (exit {:?})",
                        MAX_ATTEMPTS, code
                    )));
                }
                OutputFile::Missing if code == Some(RETRYABLE_EXIT_CODE) => {
                    tracing::warn!(task_id = %task.id, plugin = %d.name, attempt, "plugin exited with 1, retrying");
                }
                OutputFile::Missing => {
                    task.trace.extend(read_logger(&files.logger).await);
                    return Err(PluginError::ExecutionFailed(format!("fatal exit code {:?}", code)));
                }
            }
        }
        Err(PluginError::ExecutionFailed("no attempt made".to_string()))
    }

    async fn run_file_read(&self, d: &PluginDescriptor, task: &mut Task) -> Result<(), PluginError> {
        let path = resolve_path(&d.entry, &d.dir);
        let is_json = has_json_extension(&path);

        if is_json && !path.exists() {
            if let Some(default) = &d.default {
                let seed = match default {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, seed).await?;
                tracing::info!(path = %path.display(), "seeded file from default");
            }
        }

        let text = tokio::fs::read_to_string(&path).await?;
        task.output = Some(if is_json {
            serde_json::from_str(&text)
                .map_err(|e| PluginError::InvalidOutput(format!("{}: {}", path.display(), e)))?
        } else {
            Value::String(text)
        });
        Ok(())
    }

    async fn run_file_write(&self, d: &PluginDescriptor, task: &mut Task) -> Result<(), PluginError> {
        let path = resolve_path(&d.entry, &d.dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = match &task.input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        tokio::fs::write(&path, content).await?;
        task.output = Some(Value::String(String::new()));
        Ok(())
    }

    async fn run_http_get(&self, d: &PluginDescriptor, task: &mut Task) -> Result<(), PluginError> {
        let response = self
            .http
            .get(&d.entry)
            .timeout(d.timeout_duration())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PluginError::Http(e.to_string()))?;
        let text = response.text().await.map_err(|e| PluginError::Http(e.to_string()))?;
        task.output = Some(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        Ok(())
    }

    async fn run_script(&self, d: &PluginDescriptor, task: &mut Task, with_progress: bool) -> Result<(), PluginError> {
        let (workdir, files) = self.prepare_files(task).await?;
        let rendered = PathBuf::from(render_command(&d.entry, &d.dir, &files, &self.server_url));
        let script = if rendered.is_relative() { d.dir.join(rendered) } else { rendered };
        let working_dir = if d.dir.is_dir() { d.dir.clone() } else { workdir.path().to_path_buf() };

        let tail = self.start_tail(with_progress, &files, task);
        let outcome = async {
            let mut run = self
                .script_host
                .run_program(ScriptRequest {
                    script,
                    working_dir,
                    input: files.input.clone(),
                    output: files.output.clone(),
                    logger: files.logger.clone(),
                    progress: files.progress.clone(),
                })
                .await?;
            match tokio::time::timeout(d.timeout_duration(), run.wait()).await {
                Ok(result) => result,
                Err(_) => Err(PluginError::Timeout(d.timeout)),
            }
        }
        .await;
        if let Some(tail) = tail {
            tail.finish().await;
        }
        task.trace.extend(read_logger(&files.logger).await);
        outcome?;

        if !wait_file_released(&files.output).await {
            return Err(PluginError::InvalidOutput("output file not released".to_string()));
        }
        match read_output(&files.output).await {
            OutputFile::Valid(value) => {
                task.output = Some(value).filter(|v| !v.is_null());
                Ok(())
            }
            OutputFile::Invalid(reason) => Err(PluginError::InvalidOutput(reason)),
            OutputFile::Missing => Err(PluginError::ExecutionFailed("script produced no output".to_string())),
        }
    }
}

/// 在宿主 shell 中执行命令，返回退出码（被信号终止时为 None）
async fn spawn_shell(command: &str, cwd: &Path, d: &PluginDescriptor) -> Result<Option<i32>, PluginError> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| PluginError::Spawn(e.to_string()))?;
    let output = tokio::time::timeout(d.timeout_duration(), child.wait_with_output())
        .await
        .map_err(|_| PluginError::Timeout(d.timeout))?
        .map_err(|e| PluginError::Spawn(format!("wait failed: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(plugin = %d.name, "stderr: {}", stderr.trim());
        }
    }
    Ok(output.status.code())
}

async fn read_output(path: &Path) -> OutputFile {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => OutputFile::Valid(value),
            Err(e) => OutputFile::Invalid(e.to_string()),
        },
        Err(_) => OutputFile::Missing,
    }
}

async fn read_logger(path: &Path) -> Vec<String> {
    tokio::fs::read_to_string(path)
        .await
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn has_json_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::script::ProcessScriptHost;
    use serde_json::json;

    fn executor() -> (PluginExecutor, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(ProcessScriptHost::new(Some("sh".to_string())));
        (PluginExecutor::new("http://127.0.0.1:9701", host, tx), rx)
    }

    fn spawn_count(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("count"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_commandline_echo() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("echo", "", "cat {input} > {output}; echo done > {Logger}").with_dir(dir.path());
        let mut task = Task::plugin("echo", json!("hi")).with_id("t1");
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!("hi")));
        assert_eq!(task.trace.logs, vec!["done".to_string()]);
        assert!(task.trace.message.is_none());
    }

    #[tokio::test]
    async fn test_invalid_output_stops_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("bad", "commandline", "echo x >> {.}/count; echo 'not json' > {output}")
            .with_dir(dir.path());
        let mut task = Task::plugin("bad", json!(null));
        exec.run(&d, &mut task).await;
        assert!(task.output.is_none());
        assert!(task.trace.message.as_deref().unwrap().contains("Invalid output"));
        let spawns = spawn_count(dir.path());
        assert_eq!(spawns, 1);
    }

    #[tokio::test]
    async fn test_exit_one_retries_three_times() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("flaky", "", "echo x >> {.}/count; exit 1").with_dir(dir.path());
        let mut task = Task::plugin("flaky", json!({}));
        exec.run(&d, &mut task).await;
        assert_eq!(spawn_count(dir.path()), 3);
        assert!(task.trace.message.as_deref().unwrap().contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_other_exit_code_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("fatal", "", "echo x >> {.}/count; exit 2").with_dir(dir.path());
        let mut task = Task::plugin("fatal", json!({}));
        exec.run(&d, &mut task).await;
        assert_eq!(spawn_count(dir.path()), 1);
        assert!(task.trace.message.as_deref().unwrap().contains("fatal exit code"));
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("quiet", "", "echo x >> {.}/count").with_dir(dir.path());
        let mut task = Task::plugin("quiet", json!({}));
        exec.run(&d, &mut task).await;
        assert_eq!(spawn_count(dir.path()), 1);
        assert!(task.trace.has_error());
    }

    #[tokio::test]
    async fn test_timeout_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let mut d = PluginDescriptor::new("slow", "", "sleep 5; cat {input} > {output}").with_dir(dir.path());
        d.timeout = 100;
        let mut task = Task::plugin("slow", json!(1));
        exec.run(&d, &mut task).await;
        assert!(task.output.is_none());
        assert!(task.trace.message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_progress_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, mut rx) = executor();
        let d = PluginDescriptor::new(
            "steps",
            "",
            "echo 'a {\"p\":1}' >> {progress}; echo 'a {\"p\":1}' >> {progress}; \
             echo 'b {\"p\":2}' >> {Progress}; echo 1 > {output}",
        )
        .with_dir(dir.path());
        let mut task = Task::plugin("steps", json!({})).with_id("t-progress");
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!(1)));

        let mut got = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.task_id, "t-progress");
            got.push(update.progress);
        }
        assert_eq!(got, vec![json!({"p": 1}), json!({"p": 2})]);
    }

    #[tokio::test]
    async fn test_file_read_seeds_default() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let mut d = PluginDescriptor::new("settings", "file", "{plugin}/data/settings.json").with_dir(dir.path());
        d.default = Some(json!({"theme": "dark"}));
        let mut task = Task::plugin("settings", Value::Null);
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!({"theme": "dark"})));
        assert!(dir.path().join("data/settings.json").exists());
    }

    #[tokio::test]
    async fn test_file_read_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("notes", "FileRead", "notes.txt").with_dir(dir.path());
        let mut task = Task::plugin("notes", Value::Null);
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("save", "filewrite", "out/raw.txt").with_dir(dir.path());
        let mut task = Task::plugin("save", json!("raw text"));
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!("")));
        assert_eq!(std::fs::read_to_string(dir.path().join("out/raw.txt")).unwrap(), "raw text");

        let mut task = Task::plugin("save", json!({"k": 1}));
        exec.run(&d, &mut task).await;
        assert_eq!(std::fs::read_to_string(dir.path().join("out/raw.txt")).unwrap(), r#"{"k":1}"#);
    }

    #[tokio::test]
    async fn test_http_get() {
        use axum::{routing::get, Json, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/data", get(|| async { Json(json!({"a": 1})) }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("fetch", "httpget", format!("http://{}/data", addr));
        let mut task = Task::plugin("fetch", Value::Null);
        exec.run(&d, &mut task).await;
        assert_eq!(task.output, Some(json!({"a": 1})));

        let d = PluginDescriptor::new("fetch", "httpget", format!("http://{}/missing", addr));
        let mut task = Task::plugin("fetch", Value::Null);
        exec.run(&d, &mut task).await;
        assert!(task.trace.message.as_deref().unwrap().starts_with("Http error"));
    }

    #[tokio::test]
    async fn test_script_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.sh"),
            "echo 'x {\"p\":50}' >> \"$4\"\necho log-line > \"$3\"\ncp \"$1\" \"$2\"\n",
        )
        .unwrap();
        let (exec, mut rx) = executor();
        let d = PluginDescriptor::new("script", "typesharp-progress", "main.sh").with_dir(dir.path());
        let mut task = Task::plugin("script", json!({"v": 7})).with_id("s1");
        exec.run(&d, &mut task).await;

        assert_eq!(task.output, Some(json!({"v": 7})));
        assert_eq!(task.trace.logs, vec!["log-line".to_string()]);
        assert_eq!(rx.try_recv().unwrap().progress, json!({"p": 50}));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let (exec, _rx) = executor();
        let d = PluginDescriptor::new("odd", "ftp", "");
        let mut task = Task::plugin("odd", Value::Null);
        exec.run(&d, &mut task).await;
        assert!(task.trace.message.as_deref().unwrap().contains("Unsupported plugin type"));
    }
}
