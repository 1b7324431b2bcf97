use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crawler_core::constants::{SITE_WORKERS_KEY, WORKER_STATS_KEY};
use crawler_core::CrawlerResult;
use crawler_domain::{WorkerInfo, WorkerRegistryRepository};

use super::connection::RedisStore;

pub struct RedisWorkerRegistryRepository {
    store: Arc<RedisStore>,
}

impl RedisWorkerRegistryRepository {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }

    fn kind_key(job_kind: &str) -> String {
        format!("{SITE_WORKERS_KEY}:{job_kind}")
    }
}

#[async_trait]
impl WorkerRegistryRepository for RedisWorkerRegistryRepository {
    async fn register(&self, worker: &WorkerInfo) -> CrawlerResult<()> {
        let payload = serde_json::to_string(worker)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(WORKER_STATS_KEY).arg(&worker.worker_id).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;

        for kind in &worker.capabilities.job_kinds {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(Self::kind_key(kind)).arg(&worker.worker_id);
            let _: i64 = self.store.query(&cmd).await?;
        }
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> CrawlerResult<bool> {
        let existing = self.get(worker_id).await?;
        let Some(worker) = existing else {
            return Ok(false);
        };

        for kind in &worker.capabilities.job_kinds {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(Self::kind_key(kind)).arg(worker_id);
            let _: i64 = self.store.query(&cmd).await?;
        }

        let mut cmd = redis::cmd("HDEL");
        cmd.arg(WORKER_STATS_KEY).arg(worker_id);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(true)
    }

    async fn get(&self, worker_id: &str) -> CrawlerResult<Option<WorkerInfo>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(WORKER_STATS_KEY).arg(worker_id);
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn update(&self, worker: &WorkerInfo) -> CrawlerResult<()> {
        let payload = serde_json::to_string(worker)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(WORKER_STATS_KEY).arg(&worker.worker_id).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn list(&self) -> CrawlerResult<Vec<WorkerInfo>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(WORKER_STATS_KEY);
        let entries: HashMap<String, String> = self.store.query(&cmd).await?;
        let mut workers = Vec::with_capacity(entries.len());
        for raw in entries.values() {
            workers.push(serde_json::from_str(raw)?);
        }
        Ok(workers)
    }

    async fn ids_for_kind(&self, job_kind: &str) -> CrawlerResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(Self::kind_key(job_kind));
        let ids: Vec<String> = self.store.query(&cmd).await?;
        Ok(ids)
    }
}
