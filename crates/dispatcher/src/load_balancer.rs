use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crawler_core::{CrawlerResult, LoadBalancerConfig};
use crawler_domain::{
    HeartbeatStats, WorkerCapabilities, WorkerInfo, WorkerRegistryRepository, WorkerStatus,
};

/// 负载均衡配置
#[derive(Debug, Clone)]
pub struct LoadBalancerSettings {
    /// 心跳存活窗口（秒）
    pub liveness_window_seconds: i64,
    /// CPU饱和阈值（百分比）
    pub cpu_saturation_percent: f64,
    /// 内存饱和阈值（百分比）
    pub memory_saturation_percent: f64,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            liveness_window_seconds: 300, // 5分钟心跳超时
            cpu_saturation_percent: 90.0,
            memory_saturation_percent: 90.0,
        }
    }
}

impl LoadBalancerSettings {
    pub fn from_config(config: &LoadBalancerConfig) -> Self {
        Self {
            liveness_window_seconds: config.liveness_window_seconds,
            cpu_saturation_percent: config.cpu_saturation_percent,
            memory_saturation_percent: config.memory_saturation_percent,
        }
    }
}

/// 任务计数调整
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAccounting {
    /// 分配任务：active +1
    Assigned,
    /// 任务完成：active -1，completed +1
    Completed,
    /// 任务失败：active -1，failed +1
    Failed,
}

/// 任务对Worker能力的额外要求
#[derive(Debug, Clone, Default)]
pub struct SelectionRequirements {
    pub features: Vec<String>,
}

/// 负载均衡统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub offline_workers: usize,
    pub total_active_tasks: u64,
    pub average_cpu_usage: f64,
    pub average_memory_usage: f64,
    /// 任务类型 -> 声明支持的Worker数
    pub kind_distribution: HashMap<String, usize>,
}

/// 负载均衡器 / Worker注册表
pub struct LoadBalancer {
    workers: Arc<dyn WorkerRegistryRepository>,
    settings: LoadBalancerSettings,
}

impl LoadBalancer {
    pub fn new(workers: Arc<dyn WorkerRegistryRepository>, settings: LoadBalancerSettings) -> Self {
        Self { workers, settings }
    }

    fn liveness_window(&self) -> Duration {
        Duration::seconds(self.settings.liveness_window_seconds)
    }

    /// 注册工作节点，计数器清零并按任务类型建立索引
    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: WorkerCapabilities,
    ) -> CrawlerResult<()> {
        let worker = WorkerInfo::new(worker_id, capabilities);
        self.workers.register(&worker).await?;
        info!("工作节点注册成功: {}", worker_id);
        Ok(())
    }

    /// 注销工作节点
    pub async fn unregister(&self, worker_id: &str) -> CrawlerResult<bool> {
        let removed = self.workers.unregister(worker_id).await?;
        if removed {
            info!("工作节点注销成功: {}", worker_id);
        }
        Ok(removed)
    }

    /// 更新心跳
    ///
    /// 幂等：重复相同负载只推进last_heartbeat。未注册的Worker
    /// 心跳被忽略（预期的空结果，不是错误）。
    pub async fn heartbeat(&self, worker_id: &str, stats: &HeartbeatStats) -> CrawlerResult<()> {
        let Some(mut worker) = self.workers.get(worker_id).await? else {
            warn!("收到未注册Worker的心跳: {}", worker_id);
            return Ok(());
        };

        worker.last_heartbeat = Utc::now();
        worker.cpu_usage = stats.cpu_usage;
        worker.memory_usage = stats.memory_usage;
        worker.active_tasks = stats.active_tasks;
        worker.completed_tasks = stats.completed_tasks;
        worker.failed_tasks = stats.failed_tasks;

        self.workers.update(&worker).await
    }

    /// 选择最佳工作节点
    ///
    /// 候选集：声明支持job_kind、心跳在存活窗口内、并发未满、
    /// CPU/内存未饱和。得分越低越好，同分按worker_id字典序决出，
    /// 保证选择结果确定。
    pub async fn select(
        &self,
        job_kind: Option<&str>,
        requirements: Option<&SelectionRequirements>,
    ) -> CrawlerResult<Option<String>> {
        let candidates = match job_kind {
            Some(kind) => {
                let ids = self.workers.ids_for_kind(kind).await?;
                let mut workers = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(worker) = self.workers.get(&id).await? {
                        workers.push(worker);
                    }
                }
                workers
            }
            None => self.workers.list().await?,
        };

        let now = Utc::now();
        let window = self.liveness_window();
        let mut best: Option<(f64, String)> = None;

        for worker in candidates {
            let status = worker.derived_status(
                now,
                window,
                self.settings.cpu_saturation_percent,
                self.settings.memory_saturation_percent,
            );
            if status != WorkerStatus::Active {
                continue;
            }

            let score = self.score(&worker, requirements);
            let replace = match &best {
                None => true,
                Some((best_score, best_id)) => {
                    score < *best_score
                        || (score == *best_score && worker.worker_id < *best_id)
                }
            };
            if replace {
                best = Some((score, worker.worker_id.clone()));
            }
        }

        match best {
            Some((score, worker_id)) => {
                debug!(
                    "选择工作节点: {} (得分: {:.1}, 任务类型: {:?})",
                    worker_id, score, job_kind
                );
                Ok(Some(worker_id))
            }
            None => {
                warn!("没有可用的工作节点 (任务类型: {:?})", job_kind);
                Ok(None)
            }
        }
    }

    /// 计算工作节点得分（越低越好）
    fn score(&self, worker: &WorkerInfo, requirements: Option<&SelectionRequirements>) -> f64 {
        let mut score = 0.0;

        // 当前负载
        score += worker.active_tasks as f64 * 10.0;
        score += worker.cpu_usage * 0.5;
        score += worker.memory_usage * 0.3;

        // 历史表现
        score += worker.failure_ratio() * 100.0;

        // 缺失能力惩罚
        if let Some(requirements) = requirements {
            let missing = requirements
                .features
                .iter()
                .filter(|f| !worker.capabilities.has_feature(f))
                .count();
            score += missing as f64 * 50.0;
        }

        score
    }

    /// 调整工作节点任务计数
    pub async fn account(&self, worker_id: &str, delta: TaskAccounting) -> CrawlerResult<()> {
        let Some(mut worker) = self.workers.get(worker_id).await? else {
            warn!("调整计数时未找到Worker: {}", worker_id);
            return Ok(());
        };

        match delta {
            TaskAccounting::Assigned => {
                worker.active_tasks += 1;
            }
            TaskAccounting::Completed => {
                worker.active_tasks = worker.active_tasks.saturating_sub(1);
                worker.completed_tasks += 1;
            }
            TaskAccounting::Failed => {
                worker.active_tasks = worker.active_tasks.saturating_sub(1);
                worker.failed_tasks += 1;
            }
        }

        self.workers.update(&worker).await
    }

    pub async fn get_worker(&self, worker_id: &str) -> CrawlerResult<Option<WorkerInfo>> {
        self.workers.get(worker_id).await
    }

    pub async fn list_workers(&self) -> CrawlerResult<Vec<WorkerInfo>> {
        self.workers.list().await
    }

    /// 清理失联的工作节点
    ///
    /// 心跳间隔超过2倍存活窗口的Worker被注销。其仍在处理中的
    /// 任务不在此处回收，由回收扫描（RecoveryService）负责。
    pub async fn reap(&self) -> CrawlerResult<Vec<String>> {
        let now = Utc::now();
        let threshold = self.liveness_window() * 2;
        let mut reaped = Vec::new();

        for worker in self.workers.list().await? {
            if now - worker.last_heartbeat > threshold {
                self.workers.unregister(&worker.worker_id).await?;
                info!(
                    "清理离线工作节点: {} (上次心跳: {})",
                    worker.worker_id,
                    worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
                );
                reaped.push(worker.worker_id);
            }
        }

        Ok(reaped)
    }

    /// 负载均衡统计信息
    pub async fn stats(&self) -> CrawlerResult<LoadBalanceStats> {
        let workers = self.workers.list().await?;
        let now = Utc::now();
        let window = self.liveness_window();

        let mut stats = LoadBalanceStats {
            total_workers: workers.len(),
            active_workers: 0,
            busy_workers: 0,
            offline_workers: 0,
            total_active_tasks: 0,
            average_cpu_usage: 0.0,
            average_memory_usage: 0.0,
            kind_distribution: HashMap::new(),
        };

        let mut cpu_sum = 0.0;
        let mut memory_sum = 0.0;

        for worker in &workers {
            stats.total_active_tasks += worker.active_tasks as u64;
            cpu_sum += worker.cpu_usage;
            memory_sum += worker.memory_usage;

            match worker.derived_status(
                now,
                window,
                self.settings.cpu_saturation_percent,
                self.settings.memory_saturation_percent,
            ) {
                WorkerStatus::Active => stats.active_workers += 1,
                WorkerStatus::Busy => stats.busy_workers += 1,
                WorkerStatus::Offline => stats.offline_workers += 1,
            }

            for kind in &worker.capabilities.job_kinds {
                *stats.kind_distribution.entry(kind.clone()).or_insert(0) += 1;
            }
        }

        if !workers.is_empty() {
            stats.average_cpu_usage = cpu_sum / workers.len() as f64;
            stats.average_memory_usage = memory_sum / workers.len() as f64;
        }

        Ok(stats)
    }
}
