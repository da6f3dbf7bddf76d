//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RELAY__ENABLED=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub plugins: PluginsSection,
    pub tasks: TasksSection,
    pub relay: RelaySection,
    pub script: ScriptSection,
}

/// [server] 段：WebSocket / HTTP 监听地址与对外地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub ws_bind: String,
    pub http_bind: String,
    /// `{Server}` 占位符的取值（未启用中继时）
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ws_bind: "127.0.0.1:9700".to_string(),
            http_bind: "127.0.0.1:9701".to_string(),
            public_url: "http://127.0.0.1:9701".to_string(),
        }
    }
}

/// [plugins] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    pub dir: PathBuf,
    pub enabled: bool,
    /// 目录变更后的重载去抖窗口（毫秒）
    pub reload_debounce_ms: u64,
    /// 执行软件包安装的本地插件名
    pub installer: String,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            enabled: true,
            reload_debounce_ms: 4000,
            installer: "install-package".to_string(),
        }
    }
}

impl PluginsSection {
    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

/// [tasks] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// 完成任务的保留时长（秒）
    pub retention_secs: u64,
    /// 等待任务 / Agent 回复的超时（秒）
    pub reply_timeout_secs: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            retention_secs: 600,
            reply_timeout_secs: 86_400,
        }
    }
}

/// [relay] 段：作为 Agent 连接上游 Hub
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub enabled: bool,
    /// Hub 的 WebSocket 地址
    pub hub_url: String,
    /// Hub 的 HTTP 地址；未设置时由 hub_url 推导
    pub hub_http_url: Option<String>,
    /// 本节点的 Agent ID；未设置时进程内生成一次
    pub agent_id: Option<String>,
    pub heartbeat_secs: u64,
    pub reconnect_secs: u64,
    pub reply_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            hub_url: "ws://127.0.0.1:9700".to_string(),
            hub_http_url: None,
            agent_id: None,
            heartbeat_secs: 10,
            reconnect_secs: 10,
            reply_timeout_secs: 30,
        }
    }
}

impl RelaySection {
    /// Hub HTTP 地址（去掉末尾 `/`）；未配置时为 None
    pub fn http_url(&self) -> Option<String> {
        self.hub_http_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    }
}

impl AppConfig {
    /// 跨段校验：启用中继时 Hub 的 HTTP 地址必须显式配置（Hub 的 WS 与 HTTP 监听在不同端口）
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.relay.enabled && self.relay.http_url().is_none() {
            return Err(config::ConfigError::Message(
                "relay.hub_http_url is required when relay.enabled = true".to_string(),
            ));
        }
        Ok(())
    }
}

/// [script] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptSection {
    /// 脚本解释器；未设置时直接执行脚本文件
    pub interpreter: Option<String>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量
/// 4. 校验跨段约束
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let config: AppConfig = c.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
