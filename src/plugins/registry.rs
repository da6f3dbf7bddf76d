//! 插件注册表
//!
//! 递归扫描插件目录下的清单文件，按小写名注册启用的描述；同名时仅当新描述的 Priority 严格更高才替换。
//! 重载整体替换映射，进行中的分发持有旧描述的 Arc，不受影响。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::RecommendedWatcher;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::descriptor::{is_manifest, parse_manifest, PluginDescriptor};
use super::watcher;
use super::PluginError;

type FirstLoadHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RegistryState {
    plugins: HashMap<String, Arc<PluginDescriptor>>,
    /// 名称 → 来源清单路径
    paths: HashMap<String, PathBuf>,
}

/// 插件注册表
pub struct PluginRegistry {
    dir: PathBuf,
    state: RwLock<RegistryState>,
    enabled: AtomicBool,
    /// 同一时刻只允许一次重载
    reload_lock: tokio::sync::Mutex<()>,
    generation: watch::Sender<u64>,
    first_load: Mutex<Option<FirstLoadHook>>,
    loaded_once: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl PluginRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            dir: dir.into(),
            state: RwLock::new(RegistryState::default()),
            enabled: AtomicBool::new(true),
            reload_lock: tokio::sync::Mutex::new(()),
            generation,
            first_load: Mutex::new(None),
            loaded_once: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 订阅重载代数：每次重载 / 清空后递增
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// 首次成功加载后调用一次；若已加载过则立即调用
    pub fn on_first_load(&self, hook: impl FnOnce() + Send + 'static) {
        if self.loaded_once.load(Ordering::SeqCst) {
            hook();
            return;
        }
        *self.first_load.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// 重新扫描插件目录并整体替换注册内容，返回注册的插件数
    pub async fn reload(&self) -> Result<usize, PluginError> {
        let _guard = self.reload_lock.lock().await;
        if !self.is_enabled() {
            return Ok(0);
        }

        let dir = self.dir.clone();
        let entries = tokio::task::spawn_blocking(move || scan_manifests(&dir))
            .await
            .map_err(|e| PluginError::ExecutionFailed(format!("manifest scan panicked: {}", e)))?;

        let count = self.load_descriptors(entries).await;
        tracing::info!(dir = %self.dir.display(), count, "plugins loaded");
        Ok(count)
    }

    /// 用给定描述整体替换注册内容（禁用与无名描述被跳过，同名按优先级取舍）
    pub async fn load_descriptors(&self, entries: Vec<(PluginDescriptor, PathBuf)>) -> usize {
        let mut next = RegistryState::default();
        for (descriptor, manifest) in entries {
            if !descriptor.enable {
                continue;
            }
            if descriptor.name.trim().is_empty() {
                tracing::warn!(manifest = %manifest.display(), "plugin without name skipped");
                continue;
            }
            let key = descriptor.key();
            if let Some(incumbent) = next.plugins.get(&key) {
                if descriptor.priority <= incumbent.priority {
                    tracing::debug!(plugin = %key, "lower priority duplicate ignored");
                    continue;
                }
            }
            next.paths.insert(key.clone(), manifest);
            next.plugins.insert(key, Arc::new(descriptor));
        }

        let count = next.plugins.len();
        *self.state.write().await = next;
        self.generation.send_modify(|g| *g += 1);

        if !self.loaded_once.swap(true, Ordering::SeqCst) {
            let hook = self.first_load.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(hook) = hook {
                hook();
            }
        }
        count
    }

    /// 开关注册表：关闭时清空全部描述与路径，打开时立即重载
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), PluginError> {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.reload().await?;
        } else {
            let _guard = self.reload_lock.lock().await;
            *self.state.write().await = RegistryState::default();
            self.generation.send_modify(|g| *g += 1);
            tracing::info!("plugin registry disabled");
        }
        Ok(())
    }

    pub async fn contains_plugin(&self, name: &str) -> bool {
        self.state.read().await.plugins.contains_key(&name.to_lowercase())
    }

    pub async fn try_get_plugin(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.state.read().await.plugins.get(&name.to_lowercase()).cloned()
    }

    /// 插件的来源清单路径
    pub async fn get_plugin_path(&self, name: &str) -> Option<PathBuf> {
        self.state.read().await.paths.get(&name.to_lowercase()).cloned()
    }

    /// 全部插件（按名称排序）
    pub async fn get_plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.filter_plugins(|_| true).await
    }

    pub async fn filter_plugins<F>(&self, predicate: F) -> Vec<Arc<PluginDescriptor>>
    where
        F: Fn(&PluginDescriptor) -> bool,
    {
        let state = self.state.read().await;
        let mut plugins: Vec<_> = state
            .plugins
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect();
        plugins.sort_by_key(|d| d.key());
        plugins
    }

    /// 开始监听插件目录；变更在 `debounce` 窗口内合并为一次重载
    pub fn watch(self: &Arc<Self>, debounce: Duration, token: CancellationToken) -> Result<(), PluginError> {
        std::fs::create_dir_all(&self.dir)?;
        let handle = watcher::spawn(Arc::clone(self), debounce, token)?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }
}

/// 递归收集清单中的描述；解析失败的清单记录日志后跳过
fn scan_manifests(dir: &Path) -> Vec<(PluginDescriptor, PathBuf)> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "plugin directory not found");
        return Vec::new();
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_manifest(path) {
            continue;
        }
        match parse_manifest(path) {
            Ok(descriptors) => {
                entries.extend(descriptors.into_iter().map(|d| (d, path.to_path_buf())));
            }
            Err(e) => tracing::warn!("skip manifest: {}", e),
        }
    }
    entries
}
