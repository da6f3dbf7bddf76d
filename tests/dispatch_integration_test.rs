//! 分发集成测试：编排根 + 真实 sh 命令行插件 + 内存双工通道

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hive::channel::{DuplexChannel, MemoryChannel, MessageHandler};
use hive::config::AppConfig;
use hive::protocol::{
    Envelope, AGENT_CLIENT_RUN, AGENT_REGISTER, RESPONSE, TASK_QUERY, TASK_UPDATE_PROGRESS,
};
use hive::{Orchestrator, Task, TaskStatus, PLUGIN_NOT_FOUND};
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_manifest(root: &Path, dir: &str, manifest: Value) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
}

async fn orchestrator_with(plugins: &[(&str, Value)]) -> (Arc<Orchestrator>, TempDir) {
    let root = tempfile::Builder::new().prefix("hive-plugins-").tempdir().unwrap();
    for (dir, manifest) in plugins {
        write_manifest(root.path(), dir, manifest.clone());
    }
    let mut config = AppConfig::default();
    config.plugins.dir = root.path().to_path_buf();
    let orchestrator = Orchestrator::new(config);
    orchestrator.plugins().reload().await.unwrap();
    (orchestrator, root)
}

fn echo_manifest() -> Value {
    json!({"Name": "echo", "Type": "commandline", "Entry": "cat {input} > {output}"})
}

#[tokio::test]
async fn test_echo_plugin_completes() {
    let (orc, _root) = orchestrator_with(&[("echo", echo_manifest())]).await;
    let task = orc.run(Task::plugin("echo", json!("hi"))).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!("hi")));
    assert!(task.trace.success);
}

#[tokio::test]
async fn test_unknown_capability_is_plugin_not_found() {
    let (orc, _root) = orchestrator_with(&[]).await;
    let task = orc.run(Task::plugin("nowhere", json!(1))).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.trace.message.as_deref(), Some(PLUGIN_NOT_FOUND));
}

#[tokio::test]
async fn test_invalid_output_fails_after_single_spawn() {
    let (orc, root) = orchestrator_with(&[(
        "broken",
        json!({
            "Name": "broken",
            "Entry": "echo spawn >> {plugin}/spawns.log; echo 'not json' > {output}"
        }),
    )])
    .await;
    let task = orc.run(Task::plugin("broken", json!(1))).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.trace.message.unwrap().to_lowercase().contains("invalid"));

    let spawns = std::fs::read_to_string(root.path().join("broken/spawns.log")).unwrap();
    assert_eq!(spawns.lines().count(), 1);
}

#[tokio::test]
async fn test_named_queue_caps_parallelism() {
    let (orc, _root) = orchestrator_with(&[(
        "slow",
        json!({
            "Name": "slow",
            "Entry": "sleep 0.2; cat {input} > {output}",
            "Queue": "name",
            "Concurrent": 2
        }),
    )])
    .await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let orc = Arc::clone(&orc);
            tokio::spawn(async move { orc.run(Task::plugin("slow", json!(i))).await })
        })
        .collect();

    let mut peak = 0;
    while handles.iter().any(|h| !h.is_finished()) {
        peak = peak.max(orc.tasks().running_count());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert!(peak >= 1);
    assert!(peak <= 2, "observed {} running tasks", peak);
}

#[tokio::test]
async fn test_progress_order_and_dedup() {
    let (orc, _root) = orchestrator_with(&[(
        "steps",
        json!({
            "Name": "steps",
            "Entry": "echo 'a 1' >> {progress}; echo 'a 1' >> {progress}; echo 'b 2' >> {progress}; echo 'c 3' >> {progress}; cat {input} > {output}"
        }),
    )])
    .await;
    let (ch, mut rx) = MemoryChannel::new("watcher");
    let task = orc
        .run_and_subscribe_progress(Task::plugin("steps", json!("done")), ch.clone(), false)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(ch.is_open());

    let mut seen = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let envelope = Envelope::parse(&frame).unwrap();
        assert_eq!(envelope.url, TASK_UPDATE_PROGRESS);
        assert_eq!(envelope.get_str("task_id"), Some(task.id.as_str()));
        seen.push(envelope.get("progress").cloned().unwrap());
    }
    assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_query_over_channel_after_completion() {
    let (orc, _root) = orchestrator_with(&[("echo", echo_manifest())]).await;
    let done = orc.run(Task::plugin("echo", json!({"k": 1})).with_id("q-1")).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let (ch, mut rx) = MemoryChannel::new("client");
    orc.handle_text(
        ch.clone(),
        Envelope::request(TASK_QUERY, "cid-q").with("task_id", "q-1").to_text(),
    )
    .await;
    let reply = Envelope::parse(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply.url, RESPONSE);
    let task = Task::from_value(reply.get("task").cloned().unwrap()).unwrap();
    assert_eq!(task.output, Some(json!({"k": 1})));
}

/// 模拟远端 Agent：收到运行请求后回填 Output 并经 `/response` 回复
async fn answer_one_run(
    orc: Arc<Orchestrator>,
    channel: Arc<MemoryChannel>,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let request = Envelope::parse(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(request.url, AGENT_CLIENT_RUN);
    let mut task = Task::from_value(request.get("task").cloned().unwrap()).unwrap();
    task.output = Some(json!({"ran_on": "a1", "input": task.input.clone()}));
    task.trace.log("agent ran");
    let reply = request.reply().unwrap().with("task", task.to_value());
    orc.handle_text(channel, reply.to_text()).await;
}

#[tokio::test]
async fn test_remote_agent_run_and_reregistration() {
    let (orc, _root) = orchestrator_with(&[]).await;
    let (agent_ch, mut agent_rx) = MemoryChannel::new("agent-conn");

    orc.handle_text(
        agent_ch.clone(),
        Envelope::request(AGENT_REGISTER, "reg")
            .with("agent_id", "a1")
            .with("plugins", json!([{"Name": "remote"}]))
            .to_text(),
    )
    .await;
    let ack = Envelope::parse(&agent_rx.recv().await.unwrap()).unwrap();
    assert_eq!(ack.get("ok"), Some(&json!(true)));

    let runner = Arc::clone(&orc);
    let run = tokio::spawn(async move { runner.run(Task::plugin("remote", json!(7))).await });
    answer_one_run(Arc::clone(&orc), agent_ch.clone(), &mut agent_rx).await;

    let task = run.await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!({"ran_on": "a1", "input": 7})));
    assert_eq!(task.trace.logs, vec!["agent ran".to_string()]);

    // 重注册时插件集合整体替换
    orc.handle_text(
        agent_ch.clone(),
        Envelope::request(AGENT_REGISTER, "reg-2")
            .with("agent_id", "a1")
            .with("plugins", json!([{"Name": "other"}]))
            .to_text(),
    )
    .await;
    let _ = agent_rx.recv().await;
    assert!(orc.agents().try_get_plugin("remote").await.is_none());
    assert!(orc.agents().try_get_plugin("other").await.is_some());

    let task = orc.run(Task::plugin("remote", json!(1))).await.unwrap();
    assert_eq!(task.trace.message.as_deref(), Some(PLUGIN_NOT_FOUND));

    orc.channel_closed("agent-conn").await;
    assert!(orc.agents().is_empty().await);
}
