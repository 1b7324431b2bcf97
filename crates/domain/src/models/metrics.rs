use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务执行指标
///
/// 与CrawlTask刻意分离的影子记录，监控失败不阻塞调度。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetrics {
    pub task_id: String,
    pub worker_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: MetricsStatus,
    pub items_scraped: u64,
    pub pages_crawled: u64,
    pub errors_count: u64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsStatus {
    Running,
    Completed,
    Failed,
}

impl TaskMetrics {
    pub fn begin(task_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            status: MetricsStatus::Running,
            items_scraped: 0,
            pages_crawled: 0,
            errors_count: 0,
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
        }
    }

    /// 合并部分更新，未提供的字段保持原值
    pub fn apply(&mut self, update: &MetricsUpdate) {
        if let Some(items) = update.items_scraped {
            self.items_scraped = items;
        }
        if let Some(pages) = update.pages_crawled {
            self.pages_crawled = pages;
        }
        if let Some(errors) = update.errors_count {
            self.errors_count = errors;
        }
        if let Some(memory) = update.memory_usage_mb {
            self.memory_usage_mb = memory;
        }
        if let Some(cpu) = update.cpu_usage_percent {
            self.cpu_usage_percent = cpu;
        }
    }

    pub fn finalize(&mut self, status: MetricsStatus, now: DateTime<Utc>) {
        self.end_time = Some(now);
        self.duration_seconds = Some((now - self.start_time).num_milliseconds() as f64 / 1000.0);
        self.status = status;
    }
}

/// 指标的部分更新负载
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub items_scraped: Option<u64>,
    pub pages_crawled: Option<u64>,
    pub errors_count: Option<u64>,
    pub memory_usage_mb: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
}

/// 全局运行聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_duration_seconds: f64,
    pub total_items: u64,
    pub total_pages: u64,
    pub avg_duration_seconds: f64,
    pub success_rate: f64,
    /// 任务/小时，按首条记录以来的时间窗计算
    pub throughput: f64,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceStats {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_duration_seconds: 0.0,
            total_items: 0,
            total_pages: 0,
            avg_duration_seconds: 0.0,
            success_rate: 0.0,
            throughput: 0.0,
            started_at: now,
            last_updated: now,
        }
    }
}

/// 小时粒度统计，桶键格式为 %Y-%m-%d-%H
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStats {
    pub hour: String,
    pub tasks_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub total_duration_seconds: f64,
    pub total_items: u64,
    /// Worker ID -> 该小时内经手的任务数
    pub worker_stats: HashMap<String, u64>,
}

impl HourlyStats {
    pub fn empty(hour: impl Into<String>) -> Self {
        Self {
            hour: hour.into(),
            tasks_count: 0,
            completed_count: 0,
            failed_count: 0,
            total_duration_seconds: 0.0,
            total_items: 0,
            worker_stats: HashMap::new(),
        }
    }
}

/// 小时桶键
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H").to_string()
}

/// 按Worker聚合的执行表现
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_duration_seconds: f64,
    pub avg_duration_seconds: f64,
    pub success_rate: f64,
    pub total_items: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    TaskTimeout,
    TaskFailed,
    HighMemoryUsage,
    HighCpuUsage,
    QueueOverflow,
}

impl AlertType {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::TaskTimeout | AlertType::QueueOverflow => AlertSeverity::High,
            AlertType::TaskFailed | AlertType::HighMemoryUsage => AlertSeverity::Medium,
            AlertType::HighCpuUsage => AlertSeverity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::TaskTimeout => "task_timeout",
            AlertType::TaskFailed => "task_failed",
            AlertType::HighMemoryUsage => "high_memory_usage",
            AlertType::HighCpuUsage => "high_cpu_usage",
            AlertType::QueueOverflow => "queue_overflow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// 告警信号，边沿触发、不去重
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(alert_type: AlertType, data: serde_json::Value) -> Self {
        Self {
            alert_type,
            severity: alert_type.severity(),
            data,
            timestamp: Utc::now(),
        }
    }
}
