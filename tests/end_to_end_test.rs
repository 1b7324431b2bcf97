//! 端到端集成测试：调度器、负载均衡器、监控器与工作节点
//! 在内存存储上协同运行完整的任务生命周期。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use crawler_core::CrawlerResult;
use crawler_dispatcher::{
    AlertThresholds, LoadBalancer, LoadBalancerSettings, RetryPolicy, TaskMonitor, TaskScheduler,
};
use crawler_domain::{CrawlTask, MetricsRepository, TaskPriority, TaskStateView};
use crawler_infrastructure::{
    MemoryMetricsRepository, MemoryTaskQueueRepository, MemoryWorkerRegistryRepository,
};
use crawler_worker::{
    ExecCounters, ExecutionReport, ExecutorRegistry, JobExecutor, WorkerService,
    WorkerServiceConfig,
};

/// 记录执行顺序的执行器
struct RecordingExecutor {
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, task: &CrawlTask, _worker_id: &str) -> CrawlerResult<ExecutionReport> {
        self.executed.lock().unwrap().push(task.target.clone());
        Ok(ExecutionReport {
            success: true,
            counters: ExecCounters {
                items_scraped: 5,
                pages_crawled: 1,
                errors_count: 0,
            },
            error: None,
        })
    }

    fn name(&self) -> &str {
        "adaptive"
    }
}

#[tokio::test]
async fn test_full_lifecycle_with_priority_scenario() {
    let tasks = Arc::new(MemoryTaskQueueRepository::new());
    let workers = Arc::new(MemoryWorkerRegistryRepository::new());
    let metrics = Arc::new(MemoryMetricsRepository::new());

    let scheduler = Arc::new(TaskScheduler::new(
        tasks.clone(),
        RetryPolicy {
            base_interval_seconds: 0,
            max_interval_seconds: 0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
    ));
    let balancer = Arc::new(LoadBalancer::new(
        workers.clone(),
        LoadBalancerSettings::default(),
    ));
    let monitor = Arc::new(TaskMonitor::new(
        metrics.clone(),
        AlertThresholds::default(),
    ));

    // 一个同时支持两个站点的Worker，并发上限为1
    let executed = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ExecutorRegistry::new();
    registry.register(
        "adaptive",
        Arc::new(RecordingExecutor {
            executed: executed.clone(),
        }),
    );

    let worker = Arc::new(WorkerService::new(
        WorkerServiceConfig {
            worker_id: "worker-e2e".to_string(),
            features: vec!["basic_crawling".to_string()],
            max_concurrent_tasks: 1,
            heartbeat_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            task_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(2),
        },
        scheduler.clone(),
        balancer.clone(),
        monitor.clone(),
        Arc::new(registry),
    ));

    // 提交顺序与期望的出队顺序不同：URGENT(siteA) -> HIGH(siteB) -> NORMAL(siteA)
    let urgent_a = CrawlTask::new("adaptive", "siteA/urgent", TaskPriority::Urgent, json!({}));
    let normal_a = CrawlTask::new("adaptive", "siteA/normal", TaskPriority::Normal, json!({}));
    let high_b = CrawlTask::new("adaptive", "siteB/high", TaskPriority::High, json!({}));
    let all_ids = [
        urgent_a.task_id.clone(),
        normal_a.task_id.clone(),
        high_b.task_id.clone(),
    ];
    scheduler.submit(urgent_a).await.unwrap();
    scheduler.submit(normal_a).await.unwrap();
    scheduler.submit(high_b).await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let handle = tokio::spawn(Arc::clone(&worker).run(shutdown_rx));

    // 等全部任务走到终态
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut done = 0;
        for id in &all_ids {
            if matches!(
                scheduler.find(id).await.unwrap(),
                Some(TaskStateView::Completed(_))
            ) {
                done += 1;
            }
        }
        if done == all_ids.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "任务未在期限内全部完成"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // 并发上限为1时执行顺序即出队顺序：严格按优先级
    assert_eq!(
        *executed.lock().unwrap(),
        vec!["siteA/urgent", "siteB/high", "siteA/normal"]
    );

    // 每个任务都有独立的指标影子记录
    for id in &all_ids {
        let row = metrics.get(id).await.unwrap();
        assert!(row.is_some(), "任务 {id} 缺少指标记录");
    }

    // 聚合统计与任务数一致
    let performance = monitor.performance().await.unwrap();
    assert_eq!(performance.total_tasks, 3);
    assert_eq!(performance.completed_tasks, 3);
    assert_eq!(performance.total_items, 15);
    assert!((performance.success_rate - 1.0).abs() < f64::EPSILON);

    // 调度器计数器对账
    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.counters.get("tasks_submitted"), Some(&3));
    assert_eq!(stats.counters.get("tasks_completed"), Some(&3));
    assert_eq!(stats.counters.get("tasks_processing"), Some(&0));
    assert_eq!(stats.total_queue_size, 0);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // 停机后Worker从注册表消失
    assert!(balancer.list_workers().await.unwrap().is_empty());
}
