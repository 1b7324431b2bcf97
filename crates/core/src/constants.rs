//! 共享存储中的键名约定
//!
//! 所有组件通过这些键协作，键名一旦变更需要全量滚动升级。

/// 优先级队列前缀，完整键为 `crawler:task_queue:{low|normal|high|urgent}`
pub const TASK_QUEUE_KEY: &str = "crawler:task_queue";
/// 延迟重试任务的有序集合，score为可见时间
pub const SCHEDULED_KEY: &str = "crawler:scheduled";
/// 处理中任务哈希表
pub const PROCESSING_KEY: &str = "crawler:processing";
/// 已完成任务归档
pub const COMPLETED_KEY: &str = "crawler:completed";
/// 最终失败任务归档
pub const FAILED_KEY: &str = "crawler:failed";
/// 调度器计数器
pub const STATS_KEY: &str = "crawler:stats";

/// Worker注册表
pub const WORKER_STATS_KEY: &str = "crawler:worker_stats";
/// 按任务类型索引的Worker集合前缀
pub const SITE_WORKERS_KEY: &str = "crawler:site_workers";

/// 任务指标哈希表
pub const TASK_METRICS_KEY: &str = "crawler:task_metrics";
/// 全局性能统计
pub const PERFORMANCE_KEY: &str = "crawler:performance";
/// 告警记录
pub const ALERTS_KEY: &str = "crawler:alerts";
/// 小时统计前缀
pub const HOURLY_STATS_KEY: &str = "crawler:hourly_stats";

/// 配置版本哈希表
pub const CONFIG_VERSIONS_KEY: &str = "crawler:config_versions";
/// 配置内容键前缀，完整键为 `crawler:config_content:{name}:{version}`
pub const CONFIG_CONTENT_KEY: &str = "crawler:config_content";
/// 配置更新通知频道前缀，完整频道为 `config_update:{name}`
pub const CONFIG_UPDATE_CHANNEL: &str = "config_update";

/// 调度器计数器字段名
pub const STAT_TASKS_SUBMITTED: &str = "tasks_submitted";
pub const STAT_TASKS_PROCESSING: &str = "tasks_processing";
pub const STAT_TASKS_COMPLETED: &str = "tasks_completed";
pub const STAT_TASKS_FAILED: &str = "tasks_failed";
pub const STAT_TASKS_RETRIED: &str = "tasks_retried";
