use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info};

use crawler_config::ConfigDistributor;
use crawler_core::AppConfig;
use crawler_dispatcher::{
    AlertThresholds, LoadBalancer, LoadBalancerSettings, RecoveryService, RetryPolicy,
    TaskMonitor, TaskScheduler,
};
use crawler_domain::{
    ConfigRepository, MetricsRepository, TaskQueueRepository, WorkerRegistryRepository,
};
use crawler_infrastructure::{
    RedisConfigRepository, RedisMetricsRepository, RedisStore, RedisTaskQueueRepository,
    RedisWorkerRegistryRepository,
};
use crawler_worker::{ExecutorRegistry, WorkerService, WorkerServiceConfig};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 调度侧：延迟任务提升、失联回收、离线清理、配置分发
    Scheduler,
    /// 工作节点
    Worker,
    /// 单进程同时运行两侧
    All,
}

/// 应用实例：装配所有组件并持有后台循环
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    scheduler: Arc<TaskScheduler>,
    balancer: Arc<LoadBalancer>,
    recovery: Arc<RecoveryService>,
    distributor: Arc<ConfigDistributor>,
    worker: Option<Arc<WorkerService>>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let store = Arc::new(
            RedisStore::connect(config.redis.clone())
                .await
                .context("连接共享存储失败")?,
        );

        let tasks: Arc<dyn TaskQueueRepository> =
            Arc::new(RedisTaskQueueRepository::new(store.clone()));
        let workers: Arc<dyn WorkerRegistryRepository> =
            Arc::new(RedisWorkerRegistryRepository::new(store.clone()));
        let metrics: Arc<dyn MetricsRepository> =
            Arc::new(RedisMetricsRepository::new(store.clone()));
        let config_repo: Arc<dyn ConfigRepository> =
            Arc::new(RedisConfigRepository::new(store.clone()));

        let scheduler = Arc::new(TaskScheduler::new(
            tasks.clone(),
            RetryPolicy::from_config(&config.scheduler),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            workers.clone(),
            LoadBalancerSettings::from_config(&config.load_balancer),
        ));
        let monitor = Arc::new(TaskMonitor::new(
            metrics.clone(),
            AlertThresholds::from_config(&config.monitor),
        ));
        let recovery = Arc::new(RecoveryService::new(
            tasks.clone(),
            workers.clone(),
            scheduler.clone(),
            config.load_balancer.liveness_window_seconds,
        ));

        let distributor = Arc::new(ConfigDistributor::new(
            config.config_watch.dirs.iter().map(PathBuf::from).collect(),
            Duration::from_millis(config.config_watch.debounce_ms),
            config_repo,
        ));

        let worker = if matches!(mode, AppMode::Worker | AppMode::All) {
            let executors = Arc::new(ExecutorRegistry::from_commands(&config.worker.executors));
            let service_config = WorkerServiceConfig {
                worker_id: config.effective_worker_id(),
                features: config.worker.features.clone(),
                max_concurrent_tasks: config.worker.max_concurrent_tasks,
                heartbeat_interval: Duration::from_secs(config.worker.heartbeat_interval_seconds),
                poll_interval: Duration::from_secs(config.worker.poll_interval_seconds),
                task_timeout: Duration::from_secs(config.worker.task_timeout_seconds),
                drain_grace: Duration::from_secs(config.worker.drain_grace_seconds),
            };
            Some(Arc::new(WorkerService::new(
                service_config,
                scheduler.clone(),
                balancer.clone(),
                monitor.clone(),
                executors,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            mode,
            scheduler,
            balancer,
            recovery,
            distributor,
            worker,
        })
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut joinable = Vec::new();
        let mut abortable = Vec::new();

        if matches!(self.mode, AppMode::Scheduler | AppMode::All) {
            info!("启动调度侧后台服务");

            // 配置分发：启动时全量加载，之后靠文件监控与远端通知
            let loaded = self.distributor.load_all().await?;
            info!("加载了 {} 个配置文档", loaded);
            abortable.push(Arc::clone(&self.distributor).start_update_listener());
            joinable.push(
                Arc::clone(&self.distributor)
                    .start_watching(shutdown_rx.resubscribe())
                    .context("启动配置文件监控失败")?,
            );

            // 延迟重试提升
            {
                let scheduler = self.scheduler.clone();
                let mut rx = shutdown_rx.resubscribe();
                let period = Duration::from_secs(self.config.scheduler.promote_interval_seconds);
                joinable.push(tokio::spawn(async move {
                    let mut tick = interval(period);
                    loop {
                        tokio::select! {
                            _ = rx.recv() => break,
                            _ = tick.tick() => {
                                if let Err(e) = scheduler.promote_due().await {
                                    error!("延迟任务提升失败: {}", e);
                                }
                            }
                        }
                    }
                }));
            }

            // 离线Worker清理
            {
                let balancer = self.balancer.clone();
                let mut rx = shutdown_rx.resubscribe();
                let period = Duration::from_secs(self.config.load_balancer.reap_interval_seconds);
                joinable.push(tokio::spawn(async move {
                    let mut tick = interval(period);
                    loop {
                        tokio::select! {
                            _ = rx.recv() => break,
                            _ = tick.tick() => {
                                if let Err(e) = balancer.reap().await {
                                    error!("清理离线Worker失败: {}", e);
                                }
                            }
                        }
                    }
                }));
            }

            // 失联Worker任务回收
            {
                let recovery = self.recovery.clone();
                let mut rx = shutdown_rx.resubscribe();
                let period =
                    Duration::from_secs(self.config.scheduler.recovery_sweep_interval_seconds);
                joinable.push(tokio::spawn(async move {
                    let mut tick = interval(period);
                    loop {
                        tokio::select! {
                            _ = rx.recv() => break,
                            _ = tick.tick() => {
                                if let Err(e) = recovery.sweep().await {
                                    error!("失联任务回收失败: {}", e);
                                }
                            }
                        }
                    }
                }));
            }
        }

        if let Some(worker) = &self.worker {
            let worker = Arc::clone(worker);
            let rx = shutdown_rx.resubscribe();
            joinable.push(tokio::spawn(async move {
                if let Err(e) = worker.run(rx).await {
                    error!("工作节点运行失败: {}", e);
                }
            }));
        }

        // 等待关闭信号，随后收拢所有后台任务
        let _ = shutdown_rx.recv().await;
        info!("应用开始关闭");

        for handle in joinable {
            let _ = handle.await;
        }
        for handle in abortable {
            handle.abort();
        }

        info!("应用已关闭");
        Ok(())
    }
}
