use std::sync::Arc;

use chrono::{Duration, Utc};

use crawler_dispatcher::{LoadBalancer, LoadBalancerSettings, SelectionRequirements, TaskAccounting};
use crawler_domain::{HeartbeatStats, WorkerCapabilities, WorkerRegistryRepository};
use crawler_infrastructure::MemoryWorkerRegistryRepository;

fn balancer() -> (Arc<MemoryWorkerRegistryRepository>, LoadBalancer) {
    let repo = Arc::new(MemoryWorkerRegistryRepository::new());
    let balancer = LoadBalancer::new(
        repo.clone(),
        LoadBalancerSettings {
            liveness_window_seconds: 300,
            cpu_saturation_percent: 90.0,
            memory_saturation_percent: 90.0,
        },
    );
    (repo, balancer)
}

fn capabilities(kinds: &[&str], features: &[&str], limit: u32) -> WorkerCapabilities {
    WorkerCapabilities {
        job_kinds: kinds.iter().map(|s| s.to_string()).collect(),
        features: features.iter().map(|s| s.to_string()).collect(),
        max_concurrent_tasks: limit,
    }
}

fn heartbeat(cpu: f64, memory: f64, active: u32) -> HeartbeatStats {
    HeartbeatStats {
        cpu_usage: cpu,
        memory_usage: memory,
        active_tasks: active,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_register_creates_zeroed_worker() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-001", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    let worker = balancer.get_worker("worker-001").await.unwrap().unwrap();
    assert_eq!(worker.active_tasks, 0);
    assert_eq!(worker.completed_tasks, 0);
    assert_eq!(worker.failed_tasks, 0);
}

#[tokio::test]
async fn test_heartbeat_is_idempotent() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-001", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    let stats = heartbeat(45.0, 60.0, 2);
    balancer.heartbeat("worker-001", &stats).await.unwrap();
    let first = balancer.get_worker("worker-001").await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    balancer.heartbeat("worker-001", &stats).await.unwrap();
    let second = balancer.get_worker("worker-001").await.unwrap().unwrap();

    // 重复相同负载：计数不变，只有心跳时间推进
    assert_eq!(second.active_tasks, first.active_tasks);
    assert_eq!(second.completed_tasks, first.completed_tasks);
    assert_eq!(second.cpu_usage, first.cpu_usage);
    assert!(second.last_heartbeat > first.last_heartbeat);
}

#[tokio::test]
async fn test_heartbeat_from_unknown_worker_is_ignored() {
    let (_repo, balancer) = balancer();
    // 不报错，预期的空结果
    balancer
        .heartbeat("ghost", &heartbeat(10.0, 10.0, 0))
        .await
        .unwrap();
    assert!(balancer.get_worker("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_select_prefers_lower_load() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-busy", capabilities(&["adaptive"], &[], 10))
        .await
        .unwrap();
    balancer
        .register("worker-idle", capabilities(&["adaptive"], &[], 10))
        .await
        .unwrap();

    balancer
        .heartbeat("worker-busy", &heartbeat(50.0, 50.0, 5))
        .await
        .unwrap();
    balancer
        .heartbeat("worker-idle", &heartbeat(10.0, 10.0, 0))
        .await
        .unwrap();

    let selected = balancer.select(Some("adaptive"), None).await.unwrap();
    assert_eq!(selected.as_deref(), Some("worker-idle"));
}

#[tokio::test]
async fn test_select_filters_by_kind_capacity_and_saturation() {
    let (repo, balancer) = balancer();
    balancer
        .register("worker-wrong-kind", capabilities(&["report"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-full", capabilities(&["adaptive"], &[], 2))
        .await
        .unwrap();
    balancer
        .register("worker-hot", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-silent", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-ok", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    balancer
        .heartbeat("worker-full", &heartbeat(10.0, 10.0, 2))
        .await
        .unwrap();
    balancer
        .heartbeat("worker-hot", &heartbeat(95.0, 10.0, 0))
        .await
        .unwrap();
    balancer
        .heartbeat("worker-ok", &heartbeat(20.0, 20.0, 1))
        .await
        .unwrap();

    // 心跳超出存活窗口的Worker被排除
    let mut silent = repo.get("worker-silent").await.unwrap().unwrap();
    silent.last_heartbeat = Utc::now() - Duration::seconds(301);
    repo.update(&silent).await.unwrap();

    let selected = balancer.select(Some("adaptive"), None).await.unwrap();
    assert_eq!(selected.as_deref(), Some("worker-ok"));
}

#[tokio::test]
async fn test_select_is_deterministic_on_score_tie() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-b", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-a", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    let stats = heartbeat(30.0, 30.0, 1);
    balancer.heartbeat("worker-a", &stats).await.unwrap();
    balancer.heartbeat("worker-b", &stats).await.unwrap();

    // 同分时必须稳定返回同一个候选，且不为空
    for _ in 0..5 {
        let selected = balancer.select(Some("adaptive"), None).await.unwrap();
        assert_eq!(selected.as_deref(), Some("worker-a"));
    }
}

#[tokio::test]
async fn test_select_penalizes_missing_features() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-plain", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register(
            "worker-js",
            capabilities(&["adaptive"], &["javascript", "selenium"], 5),
        )
        .await
        .unwrap();

    // plain本身负载更低，但缺失能力的惩罚应压过负载差
    balancer
        .heartbeat("worker-plain", &heartbeat(0.0, 0.0, 0))
        .await
        .unwrap();
    balancer
        .heartbeat("worker-js", &heartbeat(20.0, 20.0, 1))
        .await
        .unwrap();

    let requirements = SelectionRequirements {
        features: vec!["javascript".to_string()],
    };
    let selected = balancer
        .select(Some("adaptive"), Some(&requirements))
        .await
        .unwrap();
    assert_eq!(selected.as_deref(), Some("worker-js"));
}

#[tokio::test]
async fn test_select_returns_none_without_candidates() {
    let (_repo, balancer) = balancer();
    assert!(balancer.select(Some("adaptive"), None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_account_transitions() {
    let (_repo, balancer) = balancer();
    balancer
        .register("worker-001", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    balancer
        .account("worker-001", TaskAccounting::Assigned)
        .await
        .unwrap();
    balancer
        .account("worker-001", TaskAccounting::Assigned)
        .await
        .unwrap();
    let worker = balancer.get_worker("worker-001").await.unwrap().unwrap();
    assert_eq!(worker.active_tasks, 2);

    balancer
        .account("worker-001", TaskAccounting::Completed)
        .await
        .unwrap();
    balancer
        .account("worker-001", TaskAccounting::Failed)
        .await
        .unwrap();
    let worker = balancer.get_worker("worker-001").await.unwrap().unwrap();
    assert_eq!(worker.active_tasks, 0);
    assert_eq!(worker.completed_tasks, 1);
    assert_eq!(worker.failed_tasks, 1);

    // 计数下限为零
    balancer
        .account("worker-001", TaskAccounting::Completed)
        .await
        .unwrap();
    let worker = balancer.get_worker("worker-001").await.unwrap().unwrap();
    assert_eq!(worker.active_tasks, 0);
}

#[tokio::test]
async fn test_reap_removes_long_silent_workers() {
    let (repo, balancer) = balancer();
    balancer
        .register("worker-alive", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-dead", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();

    // 超过2倍存活窗口
    let mut dead = repo.get("worker-dead").await.unwrap().unwrap();
    dead.last_heartbeat = Utc::now() - Duration::seconds(601);
    repo.update(&dead).await.unwrap();

    let reaped = balancer.reap().await.unwrap();
    assert_eq!(reaped, vec!["worker-dead"]);
    assert!(balancer.get_worker("worker-dead").await.unwrap().is_none());
    assert!(balancer.get_worker("worker-alive").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats_breakdown() {
    let (repo, balancer) = balancer();
    balancer
        .register("worker-active", capabilities(&["adaptive"], &[], 5))
        .await
        .unwrap();
    balancer
        .register("worker-busy", capabilities(&["adaptive", "report"], &[], 2))
        .await
        .unwrap();
    balancer
        .register("worker-offline", capabilities(&["report"], &[], 5))
        .await
        .unwrap();

    balancer
        .heartbeat("worker-active", &heartbeat(40.0, 40.0, 1))
        .await
        .unwrap();
    balancer
        .heartbeat("worker-busy", &heartbeat(20.0, 20.0, 2))
        .await
        .unwrap();

    let mut offline = repo.get("worker-offline").await.unwrap().unwrap();
    offline.last_heartbeat = Utc::now() - Duration::seconds(301);
    repo.update(&offline).await.unwrap();

    let stats = balancer.stats().await.unwrap();
    assert_eq!(stats.total_workers, 3);
    assert_eq!(stats.active_workers, 1);
    assert_eq!(stats.busy_workers, 1);
    assert_eq!(stats.offline_workers, 1);
    assert_eq!(stats.total_active_tasks, 3);
    assert_eq!(stats.kind_distribution.get("adaptive"), Some(&2));
    assert_eq!(stats.kind_distribution.get("report"), Some(&2));
}
