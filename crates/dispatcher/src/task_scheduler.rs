use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crawler_core::constants::{
    STAT_TASKS_COMPLETED, STAT_TASKS_FAILED, STAT_TASKS_PROCESSING, STAT_TASKS_RETRIED,
    STAT_TASKS_SUBMITTED,
};
use crawler_core::{CrawlerError, CrawlerResult, SchedulerConfig};
use crawler_domain::{
    CompletionRecord, CrawlTask, FailureRecord, TaskPriority, TaskQueueRepository, TaskStateView,
    TaskStatus,
};

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_seconds: 60,  // 1分钟
            max_interval_seconds: 3600, // 1小时
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10%的随机抖动
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_interval_seconds: config.retry_base_interval_seconds,
            max_interval_seconds: config.retry_max_interval_seconds,
            backoff_multiplier: config.retry_backoff_multiplier,
            jitter_factor: config.retry_jitter_factor,
        }
    }

    /// 计算第retry_count次重试的退避延迟
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.base_interval_seconds as f64;
        let max = self.max_interval_seconds as f64;

        // 指数退避，封顶后加随机抖动避免雷群效应
        let exponential = base * self.backoff_multiplier.powi(retry_count as i32);
        let capped = exponential.min(max);
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_seconds = (capped + jitter).max(base);

        Duration::seconds(final_seconds as i64)
    }
}

/// fail的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// 已安排延迟重试，visible_at之前对出队不可见
    Retried {
        retry_count: u32,
        visible_at: DateTime<Utc>,
    },
    /// 重试耗尽或不可重试，已写入最终失败归档
    TerminalFailed,
    /// 不在处理中，无法处理
    NotProcessing,
}

/// 调度器统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub counters: HashMap<String, i64>,
    pub queue_sizes: HashMap<String, u64>,
    pub total_queue_size: u64,
    pub processing_count: u64,
}

/// 分布式任务调度器
///
/// 队列严格按优先级出队，同优先级之间不保证FIFO（并发弹出竞争）。
/// 低优先级任务在持续的高优先级负载下可能饥饿——这是文档化的
/// 取舍而非缺陷。
pub struct TaskScheduler {
    tasks: Arc<dyn TaskQueueRepository>,
    retry_policy: RetryPolicy,
}

impl TaskScheduler {
    pub fn new(tasks: Arc<dyn TaskQueueRepository>, retry_policy: RetryPolicy) -> Self {
        Self { tasks, retry_policy }
    }

    /// 提交任务
    ///
    /// 等价任务已在处理中/已完成/已失败时拒绝并返回false。
    /// 队列中的同ID任务不做去重，与归档检查保持低成本。
    pub async fn submit(&self, mut task: CrawlTask) -> CrawlerResult<bool> {
        // 自由扩展字段在边界处收紧为JSON对象
        if !task.parameters.is_object() {
            return Err(CrawlerError::invalid_params("parameters必须是JSON对象"));
        }
        if !task.metadata.is_object() {
            return Err(CrawlerError::invalid_params("metadata必须是JSON对象"));
        }

        // target为空时退化为参数包中的site标识，并重新生成内容ID
        if task.target.is_empty() {
            task.target = task.identifier().to_string();
            task.regenerate_task_id();
        }

        if self.tasks.is_known(&task.task_id).await? {
            warn!("任务已存在: {}", task.task_id);
            return Ok(false);
        }

        let now = Utc::now();
        match (task.status, task.scheduled_at) {
            (TaskStatus::Retrying, Some(visible_at)) if visible_at > now => {
                self.tasks.push_delayed(&task, visible_at).await?;
                debug!(
                    "重试任务延迟入队: {} (可见时间: {})",
                    task.task_id,
                    visible_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            _ => {
                self.tasks.push(&task).await?;
            }
        }

        self.tasks.incr_counter(STAT_TASKS_SUBMITTED, 1).await?;
        info!(
            "任务提交成功: {} (优先级: {:?})",
            task.task_id, task.priority
        );
        Ok(true)
    }

    /// 批量提交，返回实际接受的数量
    pub async fn submit_batch(&self, batch: Vec<CrawlTask>) -> CrawlerResult<usize> {
        let mut accepted = 0;
        for task in batch {
            if self.submit(task).await? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// 为Worker取下一个任务
    ///
    /// 先提升已到期的延迟重试，再按Urgent->Low扫描。弹出与写入
    /// 处理记录在存储侧原子完成，两个Worker不可能拿到同一任务。
    pub async fn next(&self, worker_id: &str) -> CrawlerResult<Option<CrawlTask>> {
        let now = Utc::now();
        self.tasks.promote_due(now).await?;

        match self.tasks.pop_next(worker_id, now).await? {
            Some(task) => {
                self.tasks.incr_counter(STAT_TASKS_PROCESSING, 1).await?;
                info!("分配任务给工作节点 {}: {}", worker_id, task.task_id);
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// 完成任务
    pub async fn complete(&self, task_id: &str, result: serde_json::Value) -> CrawlerResult<()> {
        if self.tasks.remove_processing(task_id).await?.is_some() {
            self.tasks.incr_counter(STAT_TASKS_PROCESSING, -1).await?;
        } else {
            warn!("完成的任务不在处理中: {}", task_id);
        }

        let record = CompletionRecord {
            task_id: task_id.to_string(),
            result,
            completed_at: Utc::now(),
        };
        self.tasks.record_completed(&record).await?;
        self.tasks.incr_counter(STAT_TASKS_COMPLETED, 1).await?;

        info!("任务完成: {}", task_id);
        Ok(())
    }

    /// 任务失败处理
    ///
    /// 可重试且未耗尽重试次数时按指数退避延迟重新入队，
    /// 否则写入最终失败归档。
    pub async fn fail(
        &self,
        task_id: &str,
        error_message: &str,
        retryable: bool,
    ) -> CrawlerResult<FailOutcome> {
        let Some(record) = self.tasks.remove_processing(task_id).await? else {
            warn!("未找到处理中的任务: {}", task_id);
            return Ok(FailOutcome::NotProcessing);
        };
        self.tasks.incr_counter(STAT_TASKS_PROCESSING, -1).await?;

        let mut task = record.task;
        let now = Utc::now();

        if retryable && task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Retrying;
            let delay = self.retry_policy.backoff_delay(task.retry_count);
            let visible_at = now + delay;
            task.scheduled_at = Some(visible_at);

            self.tasks.push_delayed(&task, visible_at).await?;
            self.tasks.incr_counter(STAT_TASKS_RETRIED, 1).await?;

            info!(
                "任务重试: {} (第{}次，{}秒后可见)",
                task_id,
                task.retry_count,
                delay.num_seconds()
            );
            Ok(FailOutcome::Retried {
                retry_count: task.retry_count,
                visible_at,
            })
        } else {
            task.status = TaskStatus::Failed;
            let retry_count = task.retry_count;
            let failure = FailureRecord {
                task,
                error: error_message.to_string(),
                failed_at: now,
                retry_count,
            };
            self.tasks.record_failed(&failure).await?;
            self.tasks.incr_counter(STAT_TASKS_FAILED, 1).await?;

            error!("任务最终失败: {} - {}", task_id, error_message);
            Ok(FailOutcome::TerminalFailed)
        }
    }

    /// 将已到期的延迟重试提升回优先级队列
    pub async fn promote_due(&self) -> CrawlerResult<u64> {
        self.tasks.promote_due(Utc::now()).await
    }

    /// 任务当前归档视图
    pub async fn find(&self, task_id: &str) -> CrawlerResult<Option<TaskStateView>> {
        self.tasks.find(task_id).await
    }

    pub async fn queue_depth(&self, priority: Option<TaskPriority>) -> CrawlerResult<u64> {
        self.tasks.queue_depth(priority).await
    }

    /// 调度器统计信息
    pub async fn stats(&self) -> CrawlerResult<SchedulerStats> {
        let counters = self.tasks.counters().await?;

        let mut queue_sizes = HashMap::new();
        let mut total = 0u64;
        for priority in TaskPriority::DESCENDING {
            let depth = self.tasks.queue_depth(Some(priority)).await?;
            queue_sizes.insert(priority.queue_suffix().to_string(), depth);
            total += depth;
        }

        let processing_count = self.tasks.list_processing().await?.len() as u64;

        Ok(SchedulerStats {
            counters,
            queue_sizes,
            total_queue_size: total,
            processing_count,
        })
    }

    /// 清理早于指定时长的已完成归档
    pub async fn purge_completed(&self, older_than: Duration) -> CrawlerResult<u64> {
        let cutoff = Utc::now() - older_than;
        let removed = self.tasks.purge_completed_before(cutoff).await?;
        if removed > 0 {
            info!("清理了 {} 个已完成的任务", removed);
        }
        Ok(removed)
    }
}
