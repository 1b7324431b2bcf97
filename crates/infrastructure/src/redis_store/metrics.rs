use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crawler_core::constants::{ALERTS_KEY, HOURLY_STATS_KEY, PERFORMANCE_KEY, TASK_METRICS_KEY};
use crawler_core::CrawlerResult;
use crawler_domain::{Alert, HourlyStats, MetricsRepository, PerformanceStats, TaskMetrics};

use super::connection::RedisStore;

/// 小时桶的存储保留时长（秒）
const HOURLY_TTL_SECONDS: u64 = 30 * 24 * 3600;
/// 告警哈希表的滑动过期时长（秒）
const ALERTS_TTL_SECONDS: u64 = 7 * 24 * 3600;

pub struct RedisMetricsRepository {
    store: Arc<RedisStore>,
}

impl RedisMetricsRepository {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }

    fn hourly_key(bucket: &str) -> String {
        format!("{HOURLY_STATS_KEY}:{bucket}")
    }
}

#[async_trait]
impl MetricsRepository for RedisMetricsRepository {
    async fn put(&self, metrics: &TaskMetrics) -> CrawlerResult<()> {
        let payload = serde_json::to_string(metrics)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(TASK_METRICS_KEY).arg(&metrics.task_id).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> CrawlerResult<Option<TaskMetrics>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(TASK_METRICS_KEY).arg(task_id);
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn list(&self) -> CrawlerResult<Vec<TaskMetrics>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(TASK_METRICS_KEY);
        let entries: HashMap<String, String> = self.store.query(&cmd).await?;
        let mut rows = Vec::with_capacity(entries.len());
        for raw in entries.values() {
            rows.push(serde_json::from_str(raw)?);
        }
        Ok(rows)
    }

    async fn remove(&self, task_id: &str) -> CrawlerResult<bool> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(TASK_METRICS_KEY).arg(task_id);
        let removed: i64 = self.store.query(&cmd).await?;
        Ok(removed > 0)
    }

    async fn load_performance(&self) -> CrawlerResult<Option<PerformanceStats>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(PERFORMANCE_KEY);
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn store_performance(&self, stats: &PerformanceStats) -> CrawlerResult<()> {
        let payload = serde_json::to_string(stats)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(PERFORMANCE_KEY).arg(payload);
        let _: String = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn load_hourly(&self, bucket: &str) -> CrawlerResult<Option<HourlyStats>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(Self::hourly_key(bucket));
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn store_hourly(&self, stats: &HourlyStats) -> CrawlerResult<()> {
        let payload = serde_json::to_string(stats)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::hourly_key(&stats.hour))
            .arg(payload)
            .arg("EX")
            .arg(HOURLY_TTL_SECONDS);
        let _: String = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn push_alert(&self, alert: &Alert) -> CrawlerResult<()> {
        let payload = serde_json::to_string(alert)?;
        // 时间戳做键保证唯一
        let field = format!(
            "{}:{}",
            alert.alert_type.as_str(),
            alert.timestamp.timestamp_millis()
        );
        let mut cmd = redis::cmd("HSET");
        cmd.arg(ALERTS_KEY).arg(field).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;

        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(ALERTS_KEY).arg(ALERTS_TTL_SECONDS);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn alerts_since(&self, since: DateTime<Utc>) -> CrawlerResult<Vec<Alert>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(ALERTS_KEY);
        let entries: HashMap<String, String> = self.store.query(&cmd).await?;

        let mut alerts = Vec::new();
        for raw in entries.values() {
            let alert: Alert = serde_json::from_str(raw)?;
            if alert.timestamp > since {
                alerts.push(alert);
            }
        }
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(alerts)
    }
}
