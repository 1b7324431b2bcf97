use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crawler_core::{CrawlerError, CrawlerResult};
use crawler_dispatcher::{LoadBalancer, TaskAccounting, TaskMonitor, TaskScheduler};
use crawler_domain::{CrawlTask, HeartbeatStats, MetricsUpdate, WorkerCapabilities};

use crate::executors::{ExecCounters, ExecutionReport, ExecutorRegistry};
use crate::resource::ResourceSampler;

/// 工作节点状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Registering,
    Running,
    Draining,
    Stopped,
}

/// 工作节点运行配置
#[derive(Debug, Clone)]
pub struct WorkerServiceConfig {
    pub worker_id: String,
    /// 声明的附加能力标记
    pub features: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// 单个外部任务的墙钟超时，超过即取消并按失败处理
    pub task_timeout: Duration,
    /// 停机时等待活跃任务的宽限期
    pub drain_grace: Duration,
}

/// 工作节点状态快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusSnapshot {
    pub worker_id: String,
    pub state: WorkerState,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub uptime_seconds: u64,
}

/// 分布式工作节点
///
/// 心跳与任务轮询是两个互不阻塞的周期循环：任务再忙心跳也要
/// 照常发出。执行结果对调度器、监控器、负载均衡器的上报互相
/// 独立且尽力而为——监控器不可用不能阻止任务被标记完成。
pub struct WorkerService {
    config: WorkerServiceConfig,
    scheduler: Arc<TaskScheduler>,
    balancer: Arc<LoadBalancer>,
    monitor: Arc<TaskMonitor>,
    executors: Arc<ExecutorRegistry>,
    sampler: ResourceSampler,
    state: Arc<RwLock<WorkerState>>,
    active: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    started_at: Instant,
}

impl WorkerService {
    pub fn new(
        config: WorkerServiceConfig,
        scheduler: Arc<TaskScheduler>,
        balancer: Arc<LoadBalancer>,
        monitor: Arc<TaskMonitor>,
        executors: Arc<ExecutorRegistry>,
    ) -> Self {
        Self {
            config,
            scheduler,
            balancer,
            monitor,
            executors,
            sampler: ResourceSampler::new(),
            state: Arc::new(RwLock::new(WorkerState::Registering)),
            active: Arc::new(RwLock::new(HashMap::new())),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// 运行直到收到关闭信号
    ///
    /// Registering -> Running -> Draining -> Stopped
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> CrawlerResult<()> {
        info!("启动工作节点: {}", self.config.worker_id);

        let capabilities = WorkerCapabilities {
            job_kinds: self.executors.kinds(),
            features: self.config.features.clone(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
        };
        self.balancer
            .register(&self.config.worker_id, capabilities)
            .await?;
        *self.state.write().await = WorkerState::Running;

        let heartbeat_handle =
            tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown_rx.resubscribe()));

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止任务轮询");
                    break;
                }
                _ = poll.tick() => {
                    // 一直取到并发满或队列空，空队列时退避一个轮询间隔
                    loop {
                        let active = self.active.read().await.len() as u32;
                        if active >= self.config.max_concurrent_tasks {
                            break;
                        }
                        match self.scheduler.next(&self.config.worker_id).await {
                            Ok(Some(task)) => {
                                info!("获取到新任务: {}", task.task_id);
                                Arc::clone(&self).spawn_execution(task).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                // 瞬态存储错误，下个轮询周期重试
                                warn!("任务轮询失败: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.drain().await;

        if let Err(e) = self.balancer.unregister(&self.config.worker_id).await {
            error!("工作节点注销失败: {}", e);
        }
        let _ = heartbeat_handle.await;

        *self.state.write().await = WorkerState::Stopped;
        info!("工作节点已停止: {}", self.config.worker_id);
        Ok(())
    }

    /// 心跳循环，固定间隔、发送失败不中断
    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("心跳任务退出");
                    break;
                }
                _ = heartbeat.tick() => {
                    let stats = self.collect_heartbeat().await;
                    if let Err(e) = self
                        .balancer
                        .heartbeat(&self.config.worker_id, &stats)
                        .await
                    {
                        error!("心跳发送失败: {}", e);
                    }
                }
            }
        }
    }

    async fn collect_heartbeat(&self) -> HeartbeatStats {
        let sample = self.sampler.sample();
        HeartbeatStats {
            cpu_usage: sample.cpu_percent,
            memory_usage: sample.memory_percent,
            active_tasks: self.active.read().await.len() as u32,
            completed_tasks: self.tasks_completed.load(Ordering::Relaxed),
            failed_tasks: self.tasks_failed.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// 等待活跃任务完成，最多等待宽限期
    async fn drain(&self) {
        *self.state.write().await = WorkerState::Draining;
        let remaining = self.active.read().await.len();
        if remaining > 0 {
            info!("等待 {} 个活跃任务完成...", remaining);
        }

        let deadline = Instant::now() + self.config.drain_grace;
        loop {
            let active = self.active.read().await.len();
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("排空超时，仍有 {} 个任务未完成", active);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// 启动一个有界并发单元执行任务
    ///
    /// 占用并发额度在spawn之前同步完成，轮询循环不会超发。
    async fn spawn_execution(self: Arc<Self>, task: CrawlTask) {
        let task_id = task.task_id.clone();
        self.active.write().await.insert(task_id.clone(), Utc::now());

        tokio::spawn(async move {
            if let Err(e) = self.monitor.begin(&task_id, &self.config.worker_id).await {
                warn!("注册任务监控失败: {}", e);
            }
            if let Err(e) = self
                .balancer
                .account(&self.config.worker_id, TaskAccounting::Assigned)
                .await
            {
                warn!("更新负载计数失败: {}", e);
            }

            let started = Instant::now();

            let Some(executor) = self.executors.get(&task.job_kind) else {
                error!("找不到任务类型 '{}' 对应的执行器", task.job_kind);
                self.report_failure(
                    &task_id,
                    &format!("不支持的任务类型: {}", task.job_kind),
                    None,
                    false,
                    started.elapsed(),
                )
                .await;
                self.active.write().await.remove(&task_id);
                return;
            };

            // 墙钟超时：超过即取消执行并按可重试失败处理，
            // 否则挂死的外部任务会永久占用一个并发额度
            let outcome = match timeout(
                self.config.task_timeout,
                executor.execute(&task, &self.config.worker_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CrawlerError::ExecutionTimeout {
                    timeout_seconds: self.config.task_timeout.as_secs(),
                }),
            };
            let duration = started.elapsed();

            match outcome {
                Ok(report) if report.success => {
                    self.report_success(&task_id, &report, duration).await;
                }
                Ok(report) => {
                    let message = report
                        .error
                        .clone()
                        .unwrap_or_else(|| "执行器执行失败".to_string());
                    self.report_failure(&task_id, &message, Some(report.counters), true, duration)
                        .await;
                }
                Err(e) => {
                    self.report_failure(&task_id, &e.to_string(), None, true, duration)
                        .await;
                }
            }

            self.active.write().await.remove(&task_id);
        });
    }

    fn metrics_update(counters: &ExecCounters) -> MetricsUpdate {
        MetricsUpdate {
            items_scraped: Some(counters.items_scraped),
            pages_crawled: Some(counters.pages_crawled),
            errors_count: Some(counters.errors_count),
            ..Default::default()
        }
    }

    async fn report_success(&self, task_id: &str, report: &ExecutionReport, duration: Duration) {
        info!(
            "任务成功完成: {} (耗时: {:.2}秒)",
            task_id,
            duration.as_secs_f64()
        );
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);

        let result = json!({
            "status": "success",
            "items_scraped": report.counters.items_scraped,
            "pages_crawled": report.counters.pages_crawled,
            "errors_count": report.counters.errors_count,
            "duration_seconds": duration.as_secs_f64(),
        });
        if let Err(e) = self.scheduler.complete(task_id, result).await {
            error!("通知调度器任务完成失败: {}", e);
        }
        if let Err(e) = self
            .monitor
            .complete(task_id, Some(&Self::metrics_update(&report.counters)))
            .await
        {
            error!("完成任务监控失败: {}", e);
        }
        if let Err(e) = self
            .balancer
            .account(&self.config.worker_id, TaskAccounting::Completed)
            .await
        {
            error!("更新负载计数失败: {}", e);
        }
    }

    async fn report_failure(
        &self,
        task_id: &str,
        message: &str,
        counters: Option<ExecCounters>,
        retryable: bool,
        duration: Duration,
    ) {
        error!(
            "任务执行失败: {} - {} (耗时: {:.2}秒)",
            task_id,
            message,
            duration.as_secs_f64()
        );
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.scheduler.fail(task_id, message, retryable).await {
            error!("通知调度器任务失败出错: {}", e);
        }

        if let Some(counters) = counters {
            if let Err(e) = self
                .monitor
                .update(task_id, &Self::metrics_update(&counters))
                .await
            {
                warn!("上报失败任务计数出错: {}", e);
            }
        }
        if let Err(e) = self
            .monitor
            .fail(
                task_id,
                json!({"error": message, "duration_seconds": duration.as_secs_f64()}),
            )
            .await
        {
            error!("失败任务监控出错: {}", e);
        }

        if let Err(e) = self
            .balancer
            .account(&self.config.worker_id, TaskAccounting::Failed)
            .await
        {
            error!("更新负载计数失败: {}", e);
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// 工作节点状态快照
    pub async fn status(&self) -> WorkerStatusSnapshot {
        WorkerStatusSnapshot {
            worker_id: self.config.worker_id.clone(),
            state: *self.state.read().await,
            active_tasks: self.active.read().await.len(),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}
