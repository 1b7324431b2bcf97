//! 领域仓储抽象
//!
//! 定义对共享存储的访问接口，遵循依赖倒置原则。调度侧服务
//! 完全无本地可恢复状态，所有可变状态都经由这些接口落在存储中，
//! 因此服务可以安全地多副本运行。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crawler_core::CrawlerResult;

use crate::models::{
    Alert, CompletionRecord, ConfigUpdateNotice, ConfigVersion, CrawlTask, FailureRecord,
    HourlyStats, PerformanceStats, ProcessingRecord, TaskMetrics, TaskPriority, TaskStateView,
    WorkerInfo,
};

/// 任务队列仓储
///
/// 多键变更（出队+绑定处理记录、延迟任务提升）必须原子执行，
/// 竞争者不能观察到中间状态。
#[async_trait]
pub trait TaskQueueRepository: Send + Sync {
    /// 入队到priority对应的桶，立即对所有Worker可见
    async fn push(&self, task: &CrawlTask) -> CrawlerResult<()>;

    /// 入延迟集合，在visible_at之前对pop_next不可见
    async fn push_delayed(&self, task: &CrawlTask, visible_at: DateTime<Utc>)
        -> CrawlerResult<()>;

    /// 将已到期的延迟任务原子地移回对应优先级桶，返回提升数量
    async fn promote_due(&self, now: DateTime<Utc>) -> CrawlerResult<u64>;

    /// 按Urgent->Low扫描，原子地弹出一个任务并写入处理记录
    async fn pop_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CrawlerResult<Option<CrawlTask>>;

    async fn get_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>>;

    /// 移除处理记录并返回原记录（不存在时返回None）
    async fn remove_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>>;

    async fn list_processing(&self) -> CrawlerResult<Vec<ProcessingRecord>>;

    async fn record_completed(&self, record: &CompletionRecord) -> CrawlerResult<()>;

    async fn record_failed(&self, record: &FailureRecord) -> CrawlerResult<()>;

    /// 任务是否已存在于处理中/已完成/已失败任一归档
    async fn is_known(&self, task_id: &str) -> CrawlerResult<bool>;

    /// 任务当前归档视图
    async fn find(&self, task_id: &str) -> CrawlerResult<Option<TaskStateView>>;

    async fn queue_depth(&self, priority: Option<TaskPriority>) -> CrawlerResult<u64>;

    async fn incr_counter(&self, name: &str, delta: i64) -> CrawlerResult<()>;

    async fn counters(&self) -> CrawlerResult<HashMap<String, i64>>;

    /// 清理早于cutoff的已完成归档，返回清理数量
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> CrawlerResult<u64>;
}

/// Worker注册表仓储
#[async_trait]
pub trait WorkerRegistryRepository: Send + Sync {
    /// 注册并按声明的任务类型建立索引
    async fn register(&self, worker: &WorkerInfo) -> CrawlerResult<()>;

    /// 注销，同时移除所有类型索引；返回是否存在
    async fn unregister(&self, worker_id: &str) -> CrawlerResult<bool>;

    async fn get(&self, worker_id: &str) -> CrawlerResult<Option<WorkerInfo>>;

    async fn update(&self, worker: &WorkerInfo) -> CrawlerResult<()>;

    async fn list(&self) -> CrawlerResult<Vec<WorkerInfo>>;

    /// 声明支持指定任务类型的Worker ID集合
    async fn ids_for_kind(&self, job_kind: &str) -> CrawlerResult<Vec<String>>;
}

/// 任务指标仓储
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn put(&self, metrics: &TaskMetrics) -> CrawlerResult<()>;

    async fn get(&self, task_id: &str) -> CrawlerResult<Option<TaskMetrics>>;

    async fn list(&self) -> CrawlerResult<Vec<TaskMetrics>>;

    async fn remove(&self, task_id: &str) -> CrawlerResult<bool>;

    async fn load_performance(&self) -> CrawlerResult<Option<PerformanceStats>>;

    async fn store_performance(&self, stats: &PerformanceStats) -> CrawlerResult<()>;

    async fn load_hourly(&self, bucket: &str) -> CrawlerResult<Option<HourlyStats>>;

    async fn store_hourly(&self, stats: &HourlyStats) -> CrawlerResult<()>;

    async fn push_alert(&self, alert: &Alert) -> CrawlerResult<()>;

    /// since之后的告警，按时间倒序
    async fn alerts_since(&self, since: DateTime<Utc>) -> CrawlerResult<Vec<Alert>>;
}

/// 配置版本仓储与更新通知总线
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// 写入新版本：更新最新版指针并归档内容
    async fn store_version(&self, version: &ConfigVersion) -> CrawlerResult<()>;

    async fn latest(&self, name: &str) -> CrawlerResult<Option<ConfigVersion>>;

    /// 指定版本的内容
    async fn content(&self, name: &str, version: u64) -> CrawlerResult<Option<serde_json::Value>>;

    /// 已归档的版本号，升序
    async fn versions(&self, name: &str) -> CrawlerResult<Vec<u64>>;

    async fn names(&self) -> CrawlerResult<Vec<String>>;

    /// 删除最新keep个版本之外的归档内容，返回删除数量
    async fn prune(&self, name: &str, keep: usize) -> CrawlerResult<u64>;

    /// 在名称对应的频道上广播更新通知
    async fn publish_update(&self, notice: &ConfigUpdateNotice) -> CrawlerResult<()>;

    /// 订阅所有配置的更新通知
    ///
    /// 传递是尽力而为的：订阅者可能错过通知，依赖get惰性对齐。
    async fn subscribe_updates(&self) -> CrawlerResult<mpsc::UnboundedReceiver<ConfigUpdateNotice>>;
}
