//! 任务数据模型
//!
//! 线上格式沿用 PascalCase 字段名（`Id` / `Input` / `Output` / `Processor` / `Status` / `Trace`）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务 ID
pub type TaskId = String;

/// 任务状态：Pending → Running → {Completed | Failed}
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 等待执行
    #[default]
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
}

/// 处理器类型；无法识别的值统一为 Unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorType {
    Plugin,
    Script,
    #[default]
    #[serde(other)]
    Unknown,
}

/// 能力引用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    #[serde(rename = "Type", default)]
    pub kind: ProcessorType,
    #[serde(default)]
    pub name: String,
}

/// 执行轨迹：成功标记、消息、日志行
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Trace {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl Trace {
    /// 记录错误：置失败并写入消息，同时追加一行日志
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.success = false;
        self.logs.push(format!("error: {}", message));
        self.message = Some(message);
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        self.logs.extend(lines);
    }

    pub fn has_error(&self) -> bool {
        !self.success && self.message.is_some()
    }
}

/// 任务
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    #[serde(default)]
    pub id: TaskId,
    #[serde(default)]
    pub input: Value,
    /// 完成前为空；为 null 时同样视为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub processor: Processor,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub trace: Trace,
    /// 提交时间（毫秒时间戳）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// 完成时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Task {
    /// 以插件名构造任务
    pub fn plugin(name: impl Into<String>, input: Value) -> Self {
        Self {
            input,
            processor: Processor {
                kind: ProcessorType::Plugin,
                name: name.into(),
            },
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 能力名（插件名）
    pub fn capability(&self) -> &str {
        &self.processor.name
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 从远端返回的任务拷回 Output 与 Trace
    pub fn absorb(&mut self, remote: Task) {
        self.output = remote.output;
        self.trace = remote.trace;
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_format() {
        let task: Task = serde_json::from_value(json!({
            "Processor": {"Type": "Plugin", "Name": "echo"},
            "Input": "hi"
        }))
        .unwrap();
        assert_eq!(task.processor.kind, ProcessorType::Plugin);
        assert_eq!(task.capability(), "echo");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.output.is_none());

        let v = task.to_value();
        assert_eq!(v["Processor"]["Type"], "Plugin");
        assert!(v.get("Output").is_none());
    }

    #[test]
    fn test_unknown_processor_type() {
        let p: Processor = serde_json::from_value(json!({"Type": "Workflow", "Name": "x"})).unwrap();
        assert_eq!(p.kind, ProcessorType::Unknown);
    }

    #[test]
    fn test_null_output_is_absent() {
        let task: Task = serde_json::from_value(json!({"Output": null})).unwrap();
        assert!(task.output.is_none());
    }

    #[test]
    fn test_trace_error() {
        let mut trace = Trace::default();
        trace.log("step 1");
        trace.error("plugin not found");
        assert!(trace.has_error());
        assert_eq!(trace.message.as_deref(), Some("plugin not found"));
        assert_eq!(trace.logs.len(), 2);
    }
}
