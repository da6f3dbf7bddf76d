//! 节点性能快照（心跳上报）

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// 性能快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    #[serde(default)]
    pub host_name: String,
    /// CPU 平均占用（百分比）
    #[serde(default)]
    pub cpu_usage: f32,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub running_tasks: usize,
    /// 采样时间（毫秒时间戳）
    #[serde(default)]
    pub timestamp: i64,
}

/// 本机主机名
pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// 复用同一个 System 实例采样，CPU 占用取两次刷新之间的差值
pub struct PerformanceSampler {
    sys: Mutex<System>,
    host_name: String,
}

impl Default for PerformanceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
            host_name: host_name(),
        }
    }

    pub fn sample(&self, running_tasks: usize) -> Performance {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_count = sys.cpus().len().max(1);
        let cpu_usage = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / cpu_count as f32;

        Performance {
            host_name: self.host_name.clone(),
            cpu_usage,
            memory_used: sys.used_memory(),
            memory_total: sys.total_memory(),
            running_tasks,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_running_tasks() {
        let sampler = PerformanceSampler::new();
        let perf = sampler.sample(3);
        assert_eq!(perf.running_tasks, 3);
        assert!(perf.memory_total >= perf.memory_used);
        assert!(!perf.host_name.is_empty());
    }

    #[test]
    fn test_partial_snapshot_decodes() {
        let perf: Performance = serde_json::from_str(r#"{"cpu_usage": 12.5}"#).unwrap();
        assert_eq!(perf.cpu_usage, 12.5);
        assert_eq!(perf.running_tasks, 0);
    }
}
