use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crawler_core::constants::{
    COMPLETED_KEY, FAILED_KEY, PROCESSING_KEY, SCHEDULED_KEY, STATS_KEY, TASK_QUEUE_KEY,
};
use crawler_core::{CrawlerError, CrawlerResult};
use crawler_domain::{
    CompletionRecord, CrawlTask, FailureRecord, ProcessingRecord, TaskPriority,
    TaskQueueRepository, TaskStateView,
};

use super::connection::RedisStore;

/// 出队脚本：按优先级扫描，弹出即绑定处理记录，中间状态不可见
const POP_NEXT_SCRIPT: &str = r#"
for i = 1, 4 do
    local raw = redis.call('RPOP', KEYS[i])
    if raw then
        local task = cjson.decode(raw)
        task['status'] = 'processing'
        local record = cjson.encode({
            task = task,
            worker_id = ARGV[1],
            start_time = tonumber(ARGV[2]),
        })
        redis.call('HSET', KEYS[5], task['task_id'], record)
        return cjson.encode(task)
    end
end
return false
"#;

/// 延迟任务提升脚本：到期成员原子地移回优先级桶
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, raw in ipairs(due) do
    if redis.call('ZREM', KEYS[1], raw) == 1 then
        local task = cjson.decode(raw)
        redis.call('LPUSH', KEYS[2] .. ':' .. task['priority'], raw)
        moved = moved + 1
    end
end
return moved
"#;

/// 单次提升的任务数上限，防止单个调用长时间占用存储
const PROMOTE_BATCH_LIMIT: u64 = 128;

pub struct RedisTaskQueueRepository {
    store: Arc<RedisStore>,
    pop_script: redis::Script,
    promote_script: redis::Script,
}

impl RedisTaskQueueRepository {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self {
            store,
            pop_script: redis::Script::new(POP_NEXT_SCRIPT),
            promote_script: redis::Script::new(PROMOTE_DUE_SCRIPT),
        }
    }

    fn queue_key(priority: TaskPriority) -> String {
        format!("{}:{}", TASK_QUEUE_KEY, priority.queue_suffix())
    }
}

#[async_trait]
impl TaskQueueRepository for RedisTaskQueueRepository {
    async fn push(&self, task: &CrawlTask) -> CrawlerResult<()> {
        let payload = serde_json::to_string(task)?;
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(Self::queue_key(task.priority)).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn push_delayed(
        &self,
        task: &CrawlTask,
        visible_at: DateTime<Utc>,
    ) -> CrawlerResult<()> {
        let payload = serde_json::to_string(task)?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(SCHEDULED_KEY)
            .arg(visible_at.timestamp())
            .arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> CrawlerResult<u64> {
        let mut invocation = self.promote_script.prepare_invoke();
        invocation
            .key(SCHEDULED_KEY)
            .key(TASK_QUEUE_KEY)
            .arg(now.timestamp())
            .arg(PROMOTE_BATCH_LIMIT);
        let moved: u64 = self.store.invoke_script(&invocation).await?;
        if moved > 0 {
            debug!("Promoted {} delayed tasks back to priority queues", moved);
        }
        Ok(moved)
    }

    async fn pop_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CrawlerResult<Option<CrawlTask>> {
        let mut invocation = self.pop_script.prepare_invoke();
        for priority in TaskPriority::DESCENDING {
            invocation.key(Self::queue_key(priority));
        }
        invocation
            .key(PROCESSING_KEY)
            .arg(worker_id)
            .arg(now.timestamp());

        let raw: Option<String> = self.store.invoke_script(&invocation).await?;
        match raw {
            Some(payload) => {
                let task: CrawlTask = serde_json::from_str(&payload)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn get_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(PROCESSING_KEY).arg(task_id);
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(CrawlerError::from))
            .transpose()
    }

    async fn remove_processing(&self, task_id: &str) -> CrawlerResult<Option<ProcessingRecord>> {
        let record = self.get_processing(task_id).await?;
        if record.is_some() {
            let mut cmd = redis::cmd("HDEL");
            cmd.arg(PROCESSING_KEY).arg(task_id);
            let _: i64 = self.store.query(&cmd).await?;
        }
        Ok(record)
    }

    async fn list_processing(&self) -> CrawlerResult<Vec<ProcessingRecord>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(PROCESSING_KEY);
        let entries: HashMap<String, String> = self.store.query(&cmd).await?;
        let mut records = Vec::with_capacity(entries.len());
        for raw in entries.values() {
            records.push(serde_json::from_str(raw)?);
        }
        Ok(records)
    }

    async fn record_completed(&self, record: &CompletionRecord) -> CrawlerResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(COMPLETED_KEY).arg(&record.task_id).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn record_failed(&self, record: &FailureRecord) -> CrawlerResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(FAILED_KEY).arg(&record.task.task_id).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn is_known(&self, task_id: &str) -> CrawlerResult<bool> {
        for key in [PROCESSING_KEY, COMPLETED_KEY, FAILED_KEY] {
            let mut cmd = redis::cmd("HEXISTS");
            cmd.arg(key).arg(task_id);
            let exists: bool = self.store.query(&cmd).await?;
            if exists {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn find(&self, task_id: &str) -> CrawlerResult<Option<TaskStateView>> {
        if let Some(record) = self.get_processing(task_id).await? {
            return Ok(Some(TaskStateView::Processing(record)));
        }

        let mut cmd = redis::cmd("HGET");
        cmd.arg(COMPLETED_KEY).arg(task_id);
        if let Some(raw) = self.store.query::<Option<String>>(&cmd).await? {
            return Ok(Some(TaskStateView::Completed(serde_json::from_str(&raw)?)));
        }

        let mut cmd = redis::cmd("HGET");
        cmd.arg(FAILED_KEY).arg(task_id);
        if let Some(raw) = self.store.query::<Option<String>>(&cmd).await? {
            return Ok(Some(TaskStateView::Failed(serde_json::from_str(&raw)?)));
        }

        Ok(None)
    }

    async fn queue_depth(&self, priority: Option<TaskPriority>) -> CrawlerResult<u64> {
        match priority {
            Some(p) => {
                let mut cmd = redis::cmd("LLEN");
                cmd.arg(Self::queue_key(p));
                self.store.query(&cmd).await
            }
            None => {
                let mut total = 0u64;
                for p in TaskPriority::DESCENDING {
                    let mut cmd = redis::cmd("LLEN");
                    cmd.arg(Self::queue_key(p));
                    let depth: u64 = self.store.query(&cmd).await?;
                    total += depth;
                }
                Ok(total)
            }
        }
    }

    async fn incr_counter(&self, name: &str, delta: i64) -> CrawlerResult<()> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(STATS_KEY).arg(name).arg(delta);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn counters(&self) -> CrawlerResult<HashMap<String, i64>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(STATS_KEY);
        let raw: HashMap<String, i64> = self.store.query(&cmd).await?;
        Ok(raw)
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> CrawlerResult<u64> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(COMPLETED_KEY);
        let entries: HashMap<String, String> = self.store.query(&cmd).await?;

        let mut expired = Vec::new();
        for (task_id, raw) in &entries {
            let record: CompletionRecord = serde_json::from_str(raw)?;
            if record.completed_at < cutoff {
                expired.push(task_id.clone());
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("HDEL");
        cmd.arg(COMPLETED_KEY);
        for task_id in &expired {
            cmd.arg(task_id);
        }
        let removed: u64 = self.store.query(&cmd).await?;
        Ok(removed)
    }
}
