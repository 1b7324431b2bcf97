//! Redis集成测试
//!
//! 依赖本地Docker环境，默认忽略。运行方式：
//! `cargo test -p crawler-infrastructure -- --ignored`

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use testcontainers_modules::redis::{Redis, REDIS_PORT};
use testcontainers_modules::testcontainers::runners::AsyncRunner;

use crawler_core::RedisConfig;
use crawler_domain::{
    CrawlTask, TaskPriority, TaskQueueRepository, TaskStatus, WorkerCapabilities, WorkerInfo,
    WorkerRegistryRepository,
};
use crawler_infrastructure::{
    RedisStore, RedisTaskQueueRepository, RedisWorkerRegistryRepository,
};

async fn connect(url: String) -> Arc<RedisStore> {
    let config = RedisConfig {
        url,
        response_timeout_ms: 5000,
        max_retry_attempts: 3,
        retry_delay_ms: 100,
    };
    Arc::new(RedisStore::connect(config).await.expect("redis connect"))
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pop_next_is_atomic_and_priority_ordered() {
    let container = Redis::default().start().await.expect("start redis");
    let host = container.get_host().await.expect("host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("port");
    let store = connect(format!("redis://{host}:{port}/0")).await;
    let repo = RedisTaskQueueRepository::new(store);

    let urgent = CrawlTask::new("adaptive", "https://a/1", TaskPriority::Urgent, json!({}));
    let normal = CrawlTask::new("adaptive", "https://a/2", TaskPriority::Normal, json!({}));
    repo.push(&normal).await.unwrap();
    repo.push(&urgent).await.unwrap();

    let now = Utc::now();
    let first = repo.pop_next("worker-1", now).await.unwrap().unwrap();
    assert_eq!(first.task_id, urgent.task_id);
    assert_eq!(first.status, TaskStatus::Processing);

    // 弹出即绑定：处理记录与出队在同一脚本内写入
    let record = repo.get_processing(&first.task_id).await.unwrap().unwrap();
    assert_eq!(record.worker_id, "worker-1");

    let second = repo.pop_next("worker-2", now).await.unwrap().unwrap();
    assert_eq!(second.task_id, normal.task_id);
    assert!(repo.pop_next("worker-1", now).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_delayed_tasks_promote_on_schedule() {
    let container = Redis::default().start().await.expect("start redis");
    let host = container.get_host().await.expect("host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("port");
    let store = connect(format!("redis://{host}:{port}/0")).await;
    let repo = RedisTaskQueueRepository::new(store);

    let mut task = CrawlTask::new("adaptive", "https://a/1", TaskPriority::High, json!({}));
    task.status = TaskStatus::Retrying;
    let now = Utc::now();
    repo.push_delayed(&task, now + Duration::seconds(120))
        .await
        .unwrap();

    assert_eq!(repo.promote_due(now).await.unwrap(), 0);
    assert!(repo.pop_next("w", now).await.unwrap().is_none());

    let later = now + Duration::seconds(121);
    assert_eq!(repo.promote_due(later).await.unwrap(), 1);
    let popped = repo.pop_next("w", later).await.unwrap().unwrap();
    assert_eq!(popped.task_id, task.task_id);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_worker_registry_round_trip() {
    let container = Redis::default().start().await.expect("start redis");
    let host = container.get_host().await.expect("host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("port");
    let store = connect(format!("redis://{host}:{port}/0")).await;
    let repo = RedisWorkerRegistryRepository::new(store);

    let worker = WorkerInfo::new(
        "worker-001",
        WorkerCapabilities {
            job_kinds: vec!["adaptive".to_string(), "report".to_string()],
            features: vec!["javascript".to_string()],
            max_concurrent_tasks: 5,
        },
    );
    repo.register(&worker).await.unwrap();

    assert_eq!(repo.ids_for_kind("adaptive").await.unwrap(), vec!["worker-001"]);
    assert_eq!(repo.list().await.unwrap().len(), 1);

    assert!(repo.unregister("worker-001").await.unwrap());
    assert!(repo.ids_for_kind("adaptive").await.unwrap().is_empty());
    assert!(!repo.unregister("worker-001").await.unwrap());
}
