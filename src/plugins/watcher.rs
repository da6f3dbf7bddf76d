//! 插件目录监听
//!
//! 清单变更重新启动一个单次计时器，窗口内不再有变更时才触发重载；重载在监听任务内串行执行。

use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::descriptor::is_manifest;
use super::registry::PluginRegistry;
use super::PluginError;

/// 启动监听任务，返回需要保持存活的 watcher 句柄
pub(super) fn spawn(
    registry: Arc<PluginRegistry>,
    debounce: Duration,
    token: CancellationToken,
) -> Result<RecommendedWatcher, PluginError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            if let Ok(event) = result {
                let _ = event_tx.send(event);
            }
        },
        Config::default(),
    )
    .map_err(|e| PluginError::Watch(format!("Failed to create watcher: {}", e)))?;

    watcher
        .watch(registry.dir(), RecursiveMode::Recursive)
        .map_err(|e| PluginError::Watch(format!("Failed to watch {}: {}", registry.dir().display(), e)))?;
    info!("Watching for plugin changes: {}", registry.dir().display());

    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;

        loop {
            let armed = deadline;
            let fire = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Plugin watcher shutting down");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(event) if is_relevant_event(&event) => {
                        debug!("Plugin manifest change detected: {:?}", event.paths);
                        deadline = Some(Instant::now() + debounce);
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = fire => {
                    deadline = None;
                    if let Err(e) = registry.reload().await {
                        error!("Failed to reload plugins: {}", e);
                    }
                }
            }
        }
    });

    Ok(watcher)
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_manifest(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};
    use std::path::PathBuf;

    #[test]
    fn test_only_manifest_changes_are_relevant() {
        let manifest = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/p/a/plugin.json"));
        assert!(is_relevant_event(&manifest));

        let output = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/p/a/output.json"));
        assert!(!is_relevant_event(&output));

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/p/a/plugin.toml"));
        assert!(!is_relevant_event(&access));
    }

    #[tokio::test]
    async fn test_manifest_write_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PluginRegistry::new(dir.path()));
        registry.reload().await.unwrap();
        let mut generation = registry.subscribe();
        generation.borrow_and_update();

        let token = CancellationToken::new();
        registry.watch(Duration::from_millis(100), token.clone()).unwrap();

        std::fs::create_dir_all(dir.path().join("echo")).unwrap();
        std::fs::write(dir.path().join("echo/plugin.json"), r#"{"Name": "echo"}"#).unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                generation.changed().await.unwrap();
                if registry.contains_plugin("echo").await {
                    break;
                }
            }
        })
        .await;
        token.cancel();
        assert!(changed.is_ok());
    }

    #[tokio::test]
    async fn test_burst_of_writes_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("echo")).unwrap();
        let registry = Arc::new(PluginRegistry::new(dir.path()));
        registry.reload().await.unwrap();
        let mut generation = registry.subscribe();
        let start = *generation.borrow_and_update();

        let token = CancellationToken::new();
        registry.watch(Duration::from_millis(600), token.clone()).unwrap();

        let manifest = dir.path().join("echo/plugin.json");
        for i in 0..5 {
            std::fs::write(&manifest, format!(r#"{{"Name": "echo-{}"}}"#, i)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let changed = tokio::time::timeout(Duration::from_secs(10), generation.changed()).await;
        assert!(changed.is_ok());
        // 窗口内的多次写入只触发一次重载，且读到最后一次写入
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        assert_eq!(*generation.borrow(), start + 1);
        assert!(registry.contains_plugin("echo-4").await);
        assert!(!registry.contains_plugin("echo-0").await);
    }
}
