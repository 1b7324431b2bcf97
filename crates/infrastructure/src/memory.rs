//! 内存存储实现
//!
//! 与Redis实现语义一致的单进程版本，用于嵌入式部署和测试。
//! 所有多键变更在一把锁内完成，与存储侧脚本的原子性等价。

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crawler_core::CrawlerResult;
use crawler_domain::{
    Alert, CompletionRecord, ConfigRepository, ConfigUpdateNotice, ConfigVersion, CrawlTask,
    FailureRecord, HourlyStats, MetricsRepository, PerformanceStats, ProcessingRecord,
    TaskMetrics, TaskPriority, TaskQueueRepository, TaskStateView, TaskStatus, WorkerInfo,
    WorkerRegistryRepository,
};

#[derive(Default)]
struct TaskQueueInner {
    queues: HashMap<TaskPriority, VecDeque<CrawlTask>>,
    scheduled: Vec<(DateTime<Utc>, CrawlTask)>,
    processing: HashMap<String, ProcessingRecord>,
    completed: HashMap<String, CompletionRecord>,
    failed: HashMap<String, FailureRecord>,
    counters: HashMap<String, i64>,
}

/// 内存任务队列
#[derive(Default)]
pub struct MemoryTaskQueueRepository {
    inner: Mutex<TaskQueueInner>,
}

impl MemoryTaskQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueueRepository for MemoryTaskQueueRepository {
    async fn push(&self, task: &CrawlTask) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(task.priority)
            .or_default()
            .push_front(task.clone());
        Ok(())
    }

    async fn push_delayed(
        &self,
        task: &CrawlTask,
        visible_at: DateTime<Utc>,
    ) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.scheduled.push((visible_at, task.clone()));
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> CrawlerResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();
        inner.scheduled.retain(|(visible_at, task)| {
            if *visible_at <= now {
                due.push(task.clone());
                false
            } else {
                true
            }
        });
        let moved = due.len() as u64;
        for task in due {
            inner
                .queues
                .entry(task.priority)
                .or_default()
                .push_front(task);
        }
        Ok(moved)
    }

    async fn pop_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CrawlerResult<Option<CrawlTask>> {
        let mut inner = self.inner.lock().await;
        for priority in TaskPriority::DESCENDING {
            let task = inner.queues.get_mut(&priority).and_then(|q| q.pop_back());
            if let Some(mut task) = task {
                task.status = TaskStatus::Processing;
                inner.processing.insert(
                    task.task_id.clone(),
                    ProcessingRecord {
                        task: task.clone(),
                        worker_id: worker_id.to_string(),
                        start_time: now,
                    },
                );
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn get_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.processing.get(task_id).cloned())
    }

    async fn remove_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.processing.remove(task_id))
    }

    async fn list_processing(&self) -> CrawlerResult<Vec<ProcessingRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.processing.values().cloned().collect())
    }

    async fn record_completed(&self, record: &CompletionRecord) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .completed
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn record_failed(&self, record: &FailureRecord) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .failed
            .insert(record.task.task_id.clone(), record.clone());
        Ok(())
    }

    async fn is_known(&self, task_id: &str) -> CrawlerResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.processing.contains_key(task_id)
            || inner.completed.contains_key(task_id)
            || inner.failed.contains_key(task_id))
    }

    async fn find(&self, task_id: &str) -> CrawlerResult<Option<TaskStateView>> {
        let inner = self.inner.lock().await;
        if let Some(record) = inner.processing.get(task_id) {
            return Ok(Some(TaskStateView::Processing(record.clone())));
        }
        if let Some(record) = inner.completed.get(task_id) {
            return Ok(Some(TaskStateView::Completed(record.clone())));
        }
        if let Some(record) = inner.failed.get(task_id) {
            return Ok(Some(TaskStateView::Failed(record.clone())));
        }
        Ok(None)
    }

    async fn queue_depth(&self, priority: Option<TaskPriority>) -> CrawlerResult<u64> {
        let inner = self.inner.lock().await;
        let depth = match priority {
            Some(p) => inner.queues.get(&p).map_or(0, |q| q.len()),
            None => inner.queues.values().map(|q| q.len()).sum(),
        };
        Ok(depth as u64)
    }

    async fn incr_counter(&self, name: &str, delta: i64) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
        Ok(())
    }

    async fn counters(&self) -> CrawlerResult<HashMap<String, i64>> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.clone())
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> CrawlerResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.completed.len();
        inner.completed.retain(|_, r| r.completed_at >= cutoff);
        Ok((before - inner.completed.len()) as u64)
    }
}

/// 内存Worker注册表
#[derive(Default)]
pub struct MemoryWorkerRegistryRepository {
    workers: Mutex<HashMap<String, WorkerInfo>>,
}

impl MemoryWorkerRegistryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistryRepository for MemoryWorkerRegistryRepository {
    async fn register(&self, worker: &WorkerInfo) -> CrawlerResult<()> {
        let mut workers = self.workers.lock().await;
        workers.insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> CrawlerResult<bool> {
        let mut workers = self.workers.lock().await;
        Ok(workers.remove(worker_id).is_some())
    }

    async fn get(&self, worker_id: &str) -> CrawlerResult<Option<WorkerInfo>> {
        let workers = self.workers.lock().await;
        Ok(workers.get(worker_id).cloned())
    }

    async fn update(&self, worker: &WorkerInfo) -> CrawlerResult<()> {
        let mut workers = self.workers.lock().await;
        workers.insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn list(&self) -> CrawlerResult<Vec<WorkerInfo>> {
        let workers = self.workers.lock().await;
        Ok(workers.values().cloned().collect())
    }

    async fn ids_for_kind(&self, job_kind: &str) -> CrawlerResult<Vec<String>> {
        let workers = self.workers.lock().await;
        Ok(workers
            .values()
            .filter(|w| w.capabilities.supports_kind(job_kind))
            .map(|w| w.worker_id.clone())
            .collect())
    }
}

#[derive(Default)]
struct MetricsInner {
    rows: HashMap<String, TaskMetrics>,
    performance: Option<PerformanceStats>,
    hourly: HashMap<String, HourlyStats>,
    alerts: Vec<Alert>,
}

/// 内存指标仓储
#[derive(Default)]
pub struct MemoryMetricsRepository {
    inner: Mutex<MetricsInner>,
}

impl MemoryMetricsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsRepository for MemoryMetricsRepository {
    async fn put(&self, metrics: &TaskMetrics) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.rows.insert(metrics.task_id.clone(), metrics.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> CrawlerResult<Option<TaskMetrics>> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(task_id).cloned())
    }

    async fn list(&self) -> CrawlerResult<Vec<TaskMetrics>> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().cloned().collect())
    }

    async fn remove(&self, task_id: &str) -> CrawlerResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.rows.remove(task_id).is_some())
    }

    async fn load_performance(&self) -> CrawlerResult<Option<PerformanceStats>> {
        let inner = self.inner.lock().await;
        Ok(inner.performance.clone())
    }

    async fn store_performance(&self, stats: &PerformanceStats) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.performance = Some(stats.clone());
        Ok(())
    }

    async fn load_hourly(&self, bucket: &str) -> CrawlerResult<Option<HourlyStats>> {
        let inner = self.inner.lock().await;
        Ok(inner.hourly.get(bucket).cloned())
    }

    async fn store_hourly(&self, stats: &HourlyStats) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.hourly.insert(stats.hour.clone(), stats.clone());
        Ok(())
    }

    async fn push_alert(&self, alert: &Alert) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.alerts.push(alert.clone());
        Ok(())
    }

    async fn alerts_since(&self, since: DateTime<Utc>) -> CrawlerResult<Vec<Alert>> {
        let inner = self.inner.lock().await;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| a.timestamp > since)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(alerts)
    }
}

#[derive(Default)]
struct ConfigInner {
    versions: HashMap<String, Vec<ConfigVersion>>,
    subscribers: Vec<mpsc::UnboundedSender<ConfigUpdateNotice>>,
}

/// 内存配置仓储
///
/// 发布即投递给本进程内的所有订阅者，模拟存储的pub/sub频道。
#[derive(Default)]
pub struct MemoryConfigRepository {
    inner: Mutex<ConfigInner>,
}

impl MemoryConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigRepository for MemoryConfigRepository {
    async fn store_version(&self, version: &ConfigVersion) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .versions
            .entry(version.config_name.clone())
            .or_default()
            .push(version.clone());
        Ok(())
    }

    async fn latest(&self, name: &str) -> CrawlerResult<Option<ConfigVersion>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .versions
            .get(name)
            .and_then(|vs| vs.iter().max_by_key(|v| v.version))
            .cloned())
    }

    async fn content(&self, name: &str, version: u64) -> CrawlerResult<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .versions
            .get(name)
            .and_then(|vs| vs.iter().find(|v| v.version == version))
            .map(|v| v.content.clone()))
    }

    async fn versions(&self, name: &str) -> CrawlerResult<Vec<u64>> {
        let inner = self.inner.lock().await;
        let mut versions: Vec<u64> = inner
            .versions
            .get(name)
            .map(|vs| vs.iter().map(|v| v.version).collect())
            .unwrap_or_default();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn names(&self) -> CrawlerResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.versions.keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    async fn prune(&self, name: &str, keep: usize) -> CrawlerResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(versions) = inner.versions.get_mut(name) else {
            return Ok(0);
        };
        if versions.len() <= keep {
            return Ok(0);
        }
        versions.sort_by_key(|v| v.version);
        let removed = versions.len() - keep;
        versions.drain(..removed);
        Ok(removed as u64)
    }

    async fn publish_update(&self, notice: &ConfigUpdateNotice) -> CrawlerResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .retain(|tx| tx.send(notice.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_updates(
        &self,
    ) -> CrawlerResult<mpsc::UnboundedReceiver<ConfigUpdateNotice>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn task(kind: &str, target: &str, priority: TaskPriority) -> CrawlTask {
        CrawlTask::new(kind, target, priority, json!({}))
    }

    #[tokio::test]
    async fn test_pop_follows_priority_order() {
        let repo = MemoryTaskQueueRepository::new();
        repo.push(&task("a", "t1", TaskPriority::Low)).await.unwrap();
        repo.push(&task("a", "t2", TaskPriority::Urgent)).await.unwrap();
        repo.push(&task("a", "t3", TaskPriority::Normal)).await.unwrap();

        let now = Utc::now();
        let first = repo.pop_next("w1", now).await.unwrap().unwrap();
        assert_eq!(first.priority, TaskPriority::Urgent);
        assert_eq!(first.status, TaskStatus::Processing);

        let second = repo.pop_next("w1", now).await.unwrap().unwrap();
        assert_eq!(second.priority, TaskPriority::Normal);

        let third = repo.pop_next("w1", now).await.unwrap().unwrap();
        assert_eq!(third.priority, TaskPriority::Low);

        assert!(repo.pop_next("w1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_binds_processing_record() {
        let repo = MemoryTaskQueueRepository::new();
        let t = task("a", "t1", TaskPriority::High);
        repo.push(&t).await.unwrap();

        let now = Utc::now();
        let popped = repo.pop_next("worker-9", now).await.unwrap().unwrap();
        let record = repo.get_processing(&popped.task_id).await.unwrap().unwrap();
        assert_eq!(record.worker_id, "worker-9");
        assert_eq!(record.task.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_delayed_task_invisible_until_due() {
        let repo = MemoryTaskQueueRepository::new();
        let now = Utc::now();
        let t = task("a", "t1", TaskPriority::Urgent);
        repo.push_delayed(&t, now + Duration::seconds(60)).await.unwrap();

        repo.promote_due(now).await.unwrap();
        assert!(repo.pop_next("w1", now).await.unwrap().is_none());

        let later = now + Duration::seconds(61);
        assert_eq!(repo.promote_due(later).await.unwrap(), 1);
        assert!(repo.pop_next("w1", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_config_publish_reaches_subscribers() {
        let repo = MemoryConfigRepository::new();
        let mut rx = repo.subscribe_updates().await.unwrap();

        let notice = ConfigUpdateNotice {
            config_name: "sites/bjcdc".to_string(),
            version: 3,
            timestamp: Utc::now(),
        };
        repo.publish_update(&notice).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn test_config_prune_keeps_newest() {
        let repo = MemoryConfigRepository::new();
        for version in 1..=8u64 {
            repo.store_version(&ConfigVersion {
                config_name: "spider_settings".to_string(),
                version,
                checksum: format!("{version:064x}"),
                updated_at: Utc::now(),
                content: json!({"v": version}),
            })
            .await
            .unwrap();
        }

        let removed = repo.prune("spider_settings", 5).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(repo.versions("spider_settings").await.unwrap(), vec![4, 5, 6, 7, 8]);
        assert_eq!(repo.latest("spider_settings").await.unwrap().unwrap().version, 8);
    }
}
