use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crawler_core::{CrawlerResult, MonitorConfig};
use crawler_domain::{
    hour_bucket, Alert, AlertType, HourlyStats, MetricsRepository, MetricsStatus, MetricsUpdate,
    PerformanceStats, TaskMetrics, WorkerPerformance,
};

/// 告警阈值
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// 任务最大执行时间（秒）
    pub task_duration_max_seconds: i64,
    /// 最大内存使用（MB）
    pub memory_usage_max_mb: f64,
    /// 最大CPU使用率（%）
    pub cpu_usage_max_percent: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            task_duration_max_seconds: 3600,
            memory_usage_max_mb: 1024.0,
            cpu_usage_max_percent: 90.0,
        }
    }
}

impl AlertThresholds {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            task_duration_max_seconds: config.task_duration_max_seconds,
            memory_usage_max_mb: config.memory_usage_max_mb,
            cpu_usage_max_percent: config.cpu_usage_max_percent,
        }
    }
}

/// 任务监控器
///
/// 指标是CrawlTask之外的影子记录，监控写入失败不会阻塞调度。
/// 告警按每次update边沿触发，不做去重。
pub struct TaskMonitor {
    metrics: Arc<dyn MetricsRepository>,
    thresholds: AlertThresholds,
}

impl TaskMonitor {
    pub fn new(metrics: Arc<dyn MetricsRepository>, thresholds: AlertThresholds) -> Self {
        Self { metrics, thresholds }
    }

    /// 开始监控任务
    pub async fn begin(&self, task_id: &str, worker_id: &str) -> CrawlerResult<()> {
        let metrics = TaskMetrics::begin(task_id, worker_id);
        self.metrics.put(&metrics).await?;
        debug!("开始监控任务: {}", task_id);
        Ok(())
    }

    /// 合并部分指标并评估告警规则
    pub async fn update(&self, task_id: &str, update: &MetricsUpdate) -> CrawlerResult<bool> {
        let Some(mut metrics) = self.metrics.get(task_id).await? else {
            warn!("任务指标不存在: {}", task_id);
            return Ok(false);
        };

        metrics.apply(update);
        self.metrics.put(&metrics).await?;
        self.check_alerts(&metrics).await?;
        Ok(true)
    }

    /// 完成任务监控
    pub async fn complete(
        &self,
        task_id: &str,
        final_update: Option<&MetricsUpdate>,
    ) -> CrawlerResult<bool> {
        let Some(mut metrics) = self.metrics.get(task_id).await? else {
            warn!("任务指标不存在: {}", task_id);
            return Ok(false);
        };

        let now = Utc::now();
        metrics.finalize(MetricsStatus::Completed, now);
        if let Some(update) = final_update {
            metrics.apply(update);
        }
        self.metrics.put(&metrics).await?;

        self.roll_into_performance(&metrics, now).await?;
        self.roll_into_hourly(&metrics, now).await?;

        debug!(
            "完成任务监控: {} (耗时: {:.2}秒)",
            task_id,
            metrics.duration_seconds.unwrap_or(0.0)
        );
        Ok(true)
    }

    /// 任务失败监控
    pub async fn fail(&self, task_id: &str, error_info: serde_json::Value) -> CrawlerResult<bool> {
        let Some(mut metrics) = self.metrics.get(task_id).await? else {
            warn!("任务指标不存在: {}", task_id);
            return Ok(false);
        };

        let now = Utc::now();
        metrics.finalize(MetricsStatus::Failed, now);
        metrics.errors_count += 1;
        self.metrics.put(&metrics).await?;

        self.emit_alert(
            AlertType::TaskFailed,
            json!({
                "task_id": task_id,
                "worker_id": metrics.worker_id,
                "error": error_info,
                "duration": metrics.duration_seconds,
            }),
        )
        .await?;

        self.roll_into_performance(&metrics, now).await?;
        self.roll_into_hourly(&metrics, now).await?;

        warn!("任务失败监控: {}", task_id);
        Ok(true)
    }

    /// 告警规则评估：执行时长、内存、CPU
    async fn check_alerts(&self, metrics: &TaskMetrics) -> CrawlerResult<()> {
        let now = Utc::now();

        let running_seconds = (now - metrics.start_time).num_seconds();
        if running_seconds > self.thresholds.task_duration_max_seconds {
            self.emit_alert(
                AlertType::TaskTimeout,
                json!({
                    "task_id": metrics.task_id,
                    "worker_id": metrics.worker_id,
                    "duration": running_seconds,
                }),
            )
            .await?;
        }

        if metrics.memory_usage_mb > self.thresholds.memory_usage_max_mb {
            self.emit_alert(
                AlertType::HighMemoryUsage,
                json!({
                    "task_id": metrics.task_id,
                    "worker_id": metrics.worker_id,
                    "memory_usage": metrics.memory_usage_mb,
                }),
            )
            .await?;
        }

        if metrics.cpu_usage_percent > self.thresholds.cpu_usage_max_percent {
            self.emit_alert(
                AlertType::HighCpuUsage,
                json!({
                    "task_id": metrics.task_id,
                    "worker_id": metrics.worker_id,
                    "cpu_usage": metrics.cpu_usage_percent,
                }),
            )
            .await?;
        }

        Ok(())
    }

    async fn emit_alert(&self, alert_type: AlertType, data: serde_json::Value) -> CrawlerResult<()> {
        let alert = Alert::new(alert_type, data);
        warn!("记录告警: {} - {}", alert.alert_type.as_str(), alert.data);
        self.metrics.push_alert(&alert).await
    }

    /// 滚入全局聚合
    async fn roll_into_performance(
        &self,
        metrics: &TaskMetrics,
        now: DateTime<Utc>,
    ) -> CrawlerResult<()> {
        let mut stats = self
            .metrics
            .load_performance()
            .await?
            .unwrap_or_else(|| PerformanceStats::empty(now));

        stats.total_tasks += 1;
        match metrics.status {
            MetricsStatus::Completed => stats.completed_tasks += 1,
            MetricsStatus::Failed => stats.failed_tasks += 1,
            MetricsStatus::Running => {}
        }
        if let Some(duration) = metrics.duration_seconds {
            stats.total_duration_seconds += duration;
        }
        stats.total_items += metrics.items_scraped;
        stats.total_pages += metrics.pages_crawled;

        if stats.total_tasks > 0 {
            stats.avg_duration_seconds = stats.total_duration_seconds / stats.total_tasks as f64;
            stats.success_rate = stats.completed_tasks as f64 / stats.total_tasks as f64;
        }

        let elapsed_hours = (now - stats.started_at).num_seconds().max(1) as f64 / 3600.0;
        stats.throughput = stats.total_tasks as f64 / elapsed_hours;
        stats.last_updated = now;

        self.metrics.store_performance(&stats).await
    }

    /// 滚入小时桶
    async fn roll_into_hourly(
        &self,
        metrics: &TaskMetrics,
        now: DateTime<Utc>,
    ) -> CrawlerResult<()> {
        let bucket = hour_bucket(now);
        let mut stats = self
            .metrics
            .load_hourly(&bucket)
            .await?
            .unwrap_or_else(|| HourlyStats::empty(&bucket));

        stats.tasks_count += 1;
        match metrics.status {
            MetricsStatus::Completed => stats.completed_count += 1,
            MetricsStatus::Failed => stats.failed_count += 1,
            MetricsStatus::Running => {}
        }
        if let Some(duration) = metrics.duration_seconds {
            stats.total_duration_seconds += duration;
        }
        stats.total_items += metrics.items_scraped;
        *stats
            .worker_stats
            .entry(metrics.worker_id.clone())
            .or_insert(0) += 1;

        self.metrics.store_hourly(&stats).await
    }

    /// 全局聚合快照
    pub async fn performance(&self) -> CrawlerResult<PerformanceStats> {
        Ok(self
            .metrics
            .load_performance()
            .await?
            .unwrap_or_else(|| PerformanceStats::empty(Utc::now())))
    }

    /// 回看窗口内的告警，按时间倒序
    pub async fn recent_alerts(&self, lookback_hours: i64) -> CrawlerResult<Vec<Alert>> {
        let since = Utc::now() - Duration::hours(lookback_hours);
        self.metrics.alerts_since(since).await
    }

    /// 最近N小时的统计，缺失的小时补零，按时间升序
    pub async fn hourly(&self, hours: i64) -> CrawlerResult<Vec<HourlyStats>> {
        let now = Utc::now();
        let mut buckets = Vec::with_capacity(hours as usize);
        for offset in (0..hours).rev() {
            let at = now - Duration::hours(offset);
            let bucket = hour_bucket(at);
            let stats = self
                .metrics
                .load_hourly(&bucket)
                .await?
                .unwrap_or_else(|| HourlyStats::empty(&bucket));
            buckets.push(stats);
        }
        Ok(buckets)
    }

    /// 按Worker聚合执行表现
    pub async fn worker_performance(
        &self,
        worker_id: Option<&str>,
    ) -> CrawlerResult<HashMap<String, WorkerPerformance>> {
        let rows = self.metrics.list().await?;
        let mut result: HashMap<String, WorkerPerformance> = HashMap::new();

        for metrics in rows {
            if let Some(filter) = worker_id {
                if metrics.worker_id != filter {
                    continue;
                }
            }

            let entry = result.entry(metrics.worker_id.clone()).or_default();
            entry.total_tasks += 1;
            match metrics.status {
                MetricsStatus::Completed => entry.completed_tasks += 1,
                MetricsStatus::Failed => entry.failed_tasks += 1,
                MetricsStatus::Running => {}
            }
            if let Some(duration) = metrics.duration_seconds {
                entry.total_duration_seconds += duration;
            }
            entry.total_items += metrics.items_scraped;
        }

        for entry in result.values_mut() {
            if entry.total_tasks > 0 {
                entry.avg_duration_seconds =
                    entry.total_duration_seconds / entry.total_tasks as f64;
                entry.success_rate = entry.completed_tasks as f64 / entry.total_tasks as f64;
            }
        }

        Ok(result)
    }

    /// 清理早于保留期的指标，仅在显式调用时执行
    pub async fn cleanup(&self, older_than_days: i64) -> CrawlerResult<u64> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let rows = self.metrics.list().await?;
        let mut removed = 0u64;

        for metrics in rows {
            if metrics.start_time < cutoff && self.metrics.remove(&metrics.task_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("清理了 {} 个旧的任务指标", removed);
        }
        Ok(removed)
    }
}
