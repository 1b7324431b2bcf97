use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Worker声明的能力集
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCapabilities {
    /// 支持的任务类型
    pub job_kinds: Vec<String>,
    /// 附加能力标记（如 javascript、selenium、proxy）
    pub features: Vec<String>,
    /// 自报的并发上限
    pub max_concurrent_tasks: u32,
}

impl WorkerCapabilities {
    pub fn supports_kind(&self, job_kind: &str) -> bool {
        self.job_kinds.iter().any(|k| k == job_kind)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Worker注册信息，由负载均衡器持有
///
/// Worker只推送自己的更新，不读取其他节点的信息做决策。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub capabilities: WorkerCapabilities,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// 派生状态，永不落盘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Busy,
    Offline,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>, capabilities: WorkerCapabilities) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            capabilities,
            registered_at: now,
            last_heartbeat: now,
            active_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
        }
    }

    pub fn is_alive(&self, now: DateTime<Utc>, liveness_window: Duration) -> bool {
        now - self.last_heartbeat <= liveness_window
    }

    pub fn has_capacity(&self) -> bool {
        self.active_tasks < self.capabilities.max_concurrent_tasks
    }

    /// 历史失败率，无历史时为0
    pub fn failure_ratio(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 0.0;
        }
        self.failed_tasks as f64 / total as f64
    }

    pub fn derived_status(
        &self,
        now: DateTime<Utc>,
        liveness_window: Duration,
        cpu_saturation: f64,
        memory_saturation: f64,
    ) -> WorkerStatus {
        if !self.is_alive(now, liveness_window) {
            return WorkerStatus::Offline;
        }
        if !self.has_capacity()
            || self.cpu_usage > cpu_saturation
            || self.memory_usage > memory_saturation
        {
            return WorkerStatus::Busy;
        }
        WorkerStatus::Active
    }
}

/// 心跳负载，幂等：重复相同负载只推进last_heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatStats {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub uptime_seconds: u64,
}
