//! Entry 模板占位符替换
//!
//! 命令行 / 脚本插件：`{.}` `{Plugin}` `{Input}` `{Output}` `{Logger}` `{Progress}` `{Server}`（含小写写法）。
//! 文件插件：`{.}` `{Plugin}` `{Parent}` `{UserProfile}`；替换后的相对路径以插件目录为基准。

use std::path::{Path, PathBuf};

/// 单次执行的临时文件集合
#[derive(Debug, Clone)]
pub struct InvocationFiles {
    pub input: PathBuf,
    pub output: PathBuf,
    pub logger: PathBuf,
    pub progress: PathBuf,
}

impl InvocationFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            input: dir.join("input.json"),
            output: dir.join("output.json"),
            logger: dir.join("logger.log"),
            progress: dir.join("progress.log"),
        }
    }
}

fn replace_token(text: String, token: &str, value: &str) -> String {
    let title = format!("{{{}}}", token);
    let lower = format!("{{{}}}", token.to_lowercase());
    text.replace(&title, value).replace(&lower, value)
}

/// 模板是否引用了进度文件
pub fn references_progress(entry: &str) -> bool {
    entry.contains("{Progress}") || entry.contains("{progress}")
}

/// 替换命令模板
pub fn render_command(entry: &str, plugin_dir: &Path, files: &InvocationFiles, server: &str) -> String {
    let plugin = plugin_dir.display().to_string();
    let mut text = entry.replace("{.}", &plugin);
    text = replace_token(text, "Plugin", &plugin);
    text = replace_token(text, "Input", &files.input.display().to_string());
    text = replace_token(text, "Output", &files.output.display().to_string());
    text = replace_token(text, "Logger", &files.logger.display().to_string());
    text = replace_token(text, "Progress", &files.progress.display().to_string());
    replace_token(text, "Server", server)
}

/// 解析文件插件的目标路径
pub fn resolve_path(entry: &str, plugin_dir: &Path) -> PathBuf {
    let plugin = plugin_dir.display().to_string();
    let parent = plugin_dir
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| plugin.clone());
    let profile = dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let mut text = entry.replace("{.}", &plugin);
    text = replace_token(text, "Plugin", &plugin);
    text = replace_token(text, "Parent", &parent);
    text = replace_token(text, "UserProfile", &profile);

    let path = PathBuf::from(text);
    if path.is_relative() {
        plugin_dir.join(path)
    } else {
        path
    }
}
