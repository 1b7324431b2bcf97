use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info};

use crawler_core::CrawlerResult;
use crawler_domain::{TaskQueueRepository, WorkerInfo, WorkerRegistryRepository};

use crate::task_scheduler::TaskScheduler;

/// 失联Worker任务回收
///
/// Worker进程死亡不会主动归还正在处理的任务，reap也只清理注册表。
/// 本服务周期性对账：处理中记录绑定的Worker已不在注册表或心跳
/// 超出存活窗口时，把任务重新送入重试路径，避免永久卡在处理中。
pub struct RecoveryService {
    tasks: Arc<dyn TaskQueueRepository>,
    workers: Arc<dyn WorkerRegistryRepository>,
    scheduler: Arc<TaskScheduler>,
    liveness_window_seconds: i64,
}

impl RecoveryService {
    pub fn new(
        tasks: Arc<dyn TaskQueueRepository>,
        workers: Arc<dyn WorkerRegistryRepository>,
        scheduler: Arc<TaskScheduler>,
        liveness_window_seconds: i64,
    ) -> Self {
        Self {
            tasks,
            workers,
            scheduler,
            liveness_window_seconds,
        }
    }

    /// 执行一次对账扫描，返回回收的任务数
    pub async fn sweep(&self) -> CrawlerResult<u64> {
        let records = self.tasks.list_processing().await?;
        if records.is_empty() {
            return Ok(0);
        }

        let registry: HashMap<String, WorkerInfo> = self
            .workers
            .list()
            .await?
            .into_iter()
            .map(|w| (w.worker_id.clone(), w))
            .collect();

        let now = Utc::now();
        let window = Duration::seconds(self.liveness_window_seconds);
        let mut reclaimed = 0u64;

        for record in records {
            let alive = registry
                .get(&record.worker_id)
                .map(|w| w.is_alive(now, window))
                .unwrap_or(false);
            if alive {
                continue;
            }

            let task_id = record.task.task_id.clone();
            info!(
                "回收失联Worker {} 上的任务: {}",
                record.worker_id, task_id
            );

            let reason = format!("Worker {} 失联，任务被回收重新入队", record.worker_id);
            match self.scheduler.fail(&task_id, &reason, true).await {
                Ok(outcome) => {
                    debug!("任务 {} 回收结果: {:?}", task_id, outcome);
                    reclaimed += 1;
                }
                Err(e) => {
                    error!("回收任务 {} 失败: {}", task_id, e);
                }
            }
        }

        if reclaimed > 0 {
            info!("本次对账回收了 {} 个任务", reclaimed);
        }
        Ok(reclaimed)
    }
}
