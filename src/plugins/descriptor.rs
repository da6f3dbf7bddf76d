//! 插件描述与清单解析
//!
//! 清单文件（`plugin.json` / `*.plugin.json` / `plugin.toml`）包含一个描述或描述数组。
//! 字段沿用 PascalCase，同时接受小写别名。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PluginError;
use crate::task::DEFAULT_QUEUE;

/// 队列名哨兵：表示使用插件自身名称作为队列
const QUEUE_NAME_SENTINEL: &str = "name";

/// 插件描述（加载后不可变，重载时整体替换）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginDescriptor {
    #[serde(default, alias = "name")]
    pub name: String,
    #[serde(default = "default_enable", alias = "enable")]
    pub enable: bool,
    /// 执行策略；空串等价于 commandline
    #[serde(rename = "Type", default, alias = "type")]
    pub kind: String,
    /// 命令 / 路径模板
    #[serde(default, alias = "entry")]
    pub entry: String,
    /// 超时（毫秒）
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout: u64,
    /// 同名冲突时优先级高者胜出
    #[serde(default, alias = "priority")]
    pub priority: i64,
    #[serde(default = "default_queue", alias = "queue")]
    pub queue: String,
    /// 并发上限；-1 表示不限
    #[serde(default = "default_concurrent", alias = "concurrent")]
    pub concurrent: i64,
    /// file 插件：目标 JSON 不存在时的初始内容
    #[serde(default, alias = "default", skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, alias = "description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 清单所在目录（远端 Agent 通告的描述为空）
    #[serde(skip)]
    pub dir: PathBuf,
}

fn default_enable() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    86_400_000
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_concurrent() -> i64 {
    -1
}

impl Default for PluginDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            enable: default_enable(),
            kind: String::new(),
            entry: String::new(),
            timeout: default_timeout_ms(),
            priority: 0,
            queue: default_queue(),
            concurrent: default_concurrent(),
            default: None,
            description: None,
            dir: PathBuf::new(),
        }
    }
}

/// 执行策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    CommandLine,
    FileRead,
    FileWrite,
    HttpGet,
    Script,
    ScriptWithProgress,
    Unknown(String),
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            entry: entry.into(),
            ..Default::default()
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>, concurrent: i64) -> Self {
        self.queue = queue.into();
        self.concurrent = concurrent;
        self
    }

    /// 注册表键（小写名）
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn strategy(&self) -> Strategy {
        match self.kind.to_lowercase().as_str() {
            "" | "commandline" => Strategy::CommandLine,
            "file" | "fileread" => Strategy::FileRead,
            "filewrite" => Strategy::FileWrite,
            "httpget" => Strategy::HttpGet,
            "typesharp" => Strategy::Script,
            "typesharp-progress" => Strategy::ScriptWithProgress,
            other => Strategy::Unknown(other.to_string()),
        }
    }

    /// 实际使用的队列名（解析 `name` 哨兵）
    pub fn queue_name(&self) -> String {
        if self.queue.eq_ignore_ascii_case(QUEUE_NAME_SENTINEL) {
            self.name.clone()
        } else if self.queue.is_empty() {
            DEFAULT_QUEUE.to_string()
        } else {
            self.queue.clone()
        }
    }

    /// 并发上限；非正数表示不限
    pub fn concurrency(&self) -> Option<usize> {
        (self.concurrent > 0).then_some(self.concurrent as usize)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonManifest {
    Many(Vec<PluginDescriptor>),
    One(Box<PluginDescriptor>),
}

#[derive(Deserialize)]
struct TomlManifest {
    #[serde(default)]
    plugin: Vec<PluginDescriptor>,
}

/// 是否为清单文件名
pub fn is_manifest(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_lowercase(),
        None => return false,
    };
    name == "plugin.json" || name.ends_with(".plugin.json") || name == "plugin.toml"
}

/// 解析清单文件，返回其中的全部描述（`dir` 设为清单所在目录）
pub fn parse_manifest(path: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let text = std::fs::read_to_string(path)?;
    let manifest_error = |message: String| PluginError::Manifest {
        path: path.display().to_string(),
        message,
    };

    let is_toml = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let descriptors = if is_toml {
        let manifest: TomlManifest = toml::from_str(&text).map_err(|e| manifest_error(e.to_string()))?;
        if manifest.plugin.is_empty() {
            vec![toml::from_str::<PluginDescriptor>(&text).map_err(|e| manifest_error(e.to_string()))?]
        } else {
            manifest.plugin
        }
    } else {
        match serde_json::from_str::<JsonManifest>(&text).map_err(|e| manifest_error(e.to_string()))? {
            JsonManifest::Many(list) => list,
            JsonManifest::One(one) => vec![*one],
        }
    };

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(descriptors
        .into_iter()
        .map(|d| PluginDescriptor { dir: dir.clone(), ..d })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let d: PluginDescriptor = serde_json::from_str(r#"{"Name": "echo"}"#).unwrap();
        assert!(d.enable);
        assert_eq!(d.strategy(), Strategy::CommandLine);
        assert_eq!(d.timeout, 86_400_000);
        assert_eq!(d.priority, 0);
        assert_eq!(d.queue_name(), "main");
        assert_eq!(d.concurrency(), None);
    }

    #[test]
    fn test_queue_name_sentinel() {
        let d = PluginDescriptor::new("Render", "", "x").with_queue("name", 2);
        assert_eq!(d.queue_name(), "Render");
        assert_eq!(d.concurrency(), Some(2));
    }

    #[test]
    fn test_strategy_case_insensitive() {
        assert_eq!(PluginDescriptor::new("a", "FileRead", "").strategy(), Strategy::FileRead);
        assert_eq!(PluginDescriptor::new("a", "file", "").strategy(), Strategy::FileRead);
        assert_eq!(PluginDescriptor::new("a", "HttpGet", "").strategy(), Strategy::HttpGet);
        assert_eq!(
            PluginDescriptor::new("a", "TypeSharp-Progress", "").strategy(),
            Strategy::ScriptWithProgress
        );
        assert_eq!(
            PluginDescriptor::new("a", "ftp", "").strategy(),
            Strategy::Unknown("ftp".to_string())
        );
    }

    #[test]
    fn test_parse_json_array_and_object() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("plugin.json");
        std::fs::write(&one, r#"{"Name": "a", "Entry": "echo a"}"#).unwrap();
        let many = dir.path().join("tools.plugin.json");
        std::fs::write(&many, r#"[{"name": "b"}, {"Name": "c", "Enable": false}]"#).unwrap();

        let a = parse_manifest(&one).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].dir, dir.path());

        let bc = parse_manifest(&many).unwrap();
        assert_eq!(bc.len(), 2);
        assert_eq!(bc[0].name, "b");
        assert!(!bc[1].enable);
    }

    #[test]
    fn test_parse_toml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.toml");
        std::fs::write(
            &path,
            "[[plugin]]\nName = \"settings\"\nType = \"file\"\nEntry = \"{plugin}/settings.json\"\n\n[plugin.Default]\ntheme = \"dark\"\n",
        )
        .unwrap();
        let list = parse_manifest(&path).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].strategy(), Strategy::FileRead);
        assert_eq!(list[0].default.as_ref().unwrap()["theme"], "dark");
    }

    #[test]
    fn test_invalid_manifest_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = parse_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("plugin.json"));
    }

    #[test]
    fn test_is_manifest() {
        assert!(is_manifest(Path::new("/p/plugin.json")));
        assert!(is_manifest(Path::new("/p/Echo.Plugin.json")));
        assert!(is_manifest(Path::new("/p/plugin.toml")));
        assert!(!is_manifest(Path::new("/p/output.json")));
    }
}
