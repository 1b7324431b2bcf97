use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crawler_dispatcher::{FailOutcome, RetryPolicy, TaskScheduler};
use crawler_domain::{
    CrawlTask, TaskPriority, TaskQueueRepository, TaskStateView, TaskStatus,
};
use crawler_infrastructure::MemoryTaskQueueRepository;

fn scheduler_with_policy(policy: RetryPolicy) -> (Arc<MemoryTaskQueueRepository>, TaskScheduler) {
    let repo = Arc::new(MemoryTaskQueueRepository::new());
    let scheduler = TaskScheduler::new(repo.clone(), policy);
    (repo, scheduler)
}

fn scheduler() -> (Arc<MemoryTaskQueueRepository>, TaskScheduler) {
    // 测试中关闭抖动，退避时间可精确断言
    scheduler_with_policy(RetryPolicy {
        base_interval_seconds: 60,
        max_interval_seconds: 3600,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    })
}

fn task(kind: &str, target: &str, priority: TaskPriority) -> CrawlTask {
    CrawlTask::new(kind, target, priority, json!({"site": "bjcdc"}))
}

#[tokio::test]
async fn test_submit_then_next_marks_processing() {
    let (repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::Normal);
    let task_id = t.task_id.clone();

    assert!(scheduler.submit(t).await.unwrap());
    let popped = scheduler.next("worker-1").await.unwrap().unwrap();
    assert_eq!(popped.task_id, task_id);
    assert_eq!(popped.status, TaskStatus::Processing);

    let record = repo.get_processing(&task_id).await.unwrap().unwrap();
    assert_eq!(record.worker_id, "worker-1");
}

#[tokio::test]
async fn test_submit_rejects_known_task_id() {
    let (_repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::Normal);
    let duplicate = t.clone();

    assert!(scheduler.submit(t).await.unwrap());
    scheduler.next("worker-1").await.unwrap().unwrap();

    // 等价任务已在处理中，拒绝
    assert!(!scheduler.submit(duplicate.clone()).await.unwrap());

    scheduler
        .complete(&duplicate.task_id, json!({"items_count": 3}))
        .await
        .unwrap();
    // 已完成同样拒绝
    assert!(!scheduler.submit(duplicate).await.unwrap());
}

#[tokio::test]
async fn test_submit_rejects_non_object_parameters() {
    let (_repo, scheduler) = scheduler();
    let t = CrawlTask::new("adaptive", "https://a/1", TaskPriority::Normal, json!([1, 2]));
    assert!(scheduler.submit(t).await.is_err());

    let t = CrawlTask::new("adaptive", "https://a/1", TaskPriority::Normal, json!({}))
        .with_metadata(json!("free text"));
    assert!(scheduler.submit(t).await.is_err());
}

#[tokio::test]
async fn test_empty_target_rewritten_from_site() {
    let (_repo, scheduler) = scheduler();
    let t = CrawlTask::new("report", "", TaskPriority::Normal, json!({"site": "jxcdc"}));
    assert!(scheduler.submit(t).await.unwrap());

    let popped = scheduler.next("worker-1").await.unwrap().unwrap();
    assert_eq!(popped.target, "jxcdc");
}

#[tokio::test]
async fn test_strict_priority_ordering() {
    let (_repo, scheduler) = scheduler();
    // 乱序提交，覆盖全部四个优先级
    for t in [
        task("adaptive", "t-normal", TaskPriority::Normal),
        task("adaptive", "t-low", TaskPriority::Low),
        task("adaptive", "t-urgent", TaskPriority::Urgent),
        task("adaptive", "t-high", TaskPriority::High),
    ] {
        scheduler.submit(t).await.unwrap();
    }

    let order: Vec<TaskPriority> = [
        scheduler.next("w").await.unwrap().unwrap().priority,
        scheduler.next("w").await.unwrap().unwrap().priority,
        scheduler.next("w").await.unwrap().unwrap().priority,
        scheduler.next("w").await.unwrap().unwrap().priority,
    ]
    .into();
    assert_eq!(
        order,
        vec![
            TaskPriority::Urgent,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low
        ]
    );
    assert!(scheduler.next("w").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mixed_site_scenario_dequeue_order() {
    // URGENT(siteA) -> HIGH(siteB) -> NORMAL(siteA)
    let (_repo, scheduler) = scheduler();
    let urgent_a = CrawlTask::new("adaptive", "siteA/1", TaskPriority::Urgent, json!({}));
    let normal_a = CrawlTask::new("adaptive", "siteA/2", TaskPriority::Normal, json!({}));
    let high_b = CrawlTask::new("adaptive", "siteB/1", TaskPriority::High, json!({}));

    scheduler.submit(urgent_a.clone()).await.unwrap();
    scheduler.submit(normal_a.clone()).await.unwrap();
    scheduler.submit(high_b.clone()).await.unwrap();

    assert_eq!(
        scheduler.next("w").await.unwrap().unwrap().task_id,
        urgent_a.task_id
    );
    assert_eq!(
        scheduler.next("w").await.unwrap().unwrap().task_id,
        high_b.task_id
    );
    assert_eq!(
        scheduler.next("w").await.unwrap().unwrap().task_id,
        normal_a.task_id
    );
}

#[tokio::test]
async fn test_retry_backoff_until_terminal_failure() {
    let (repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::High).with_max_retries(3);
    let task_id = t.task_id.clone();
    scheduler.submit(t).await.unwrap();

    let mut previous_delay = 0i64;
    for attempt in 1..=3u32 {
        let popped = scheduler.next("worker-1").await.unwrap().unwrap();
        assert_eq!(popped.retry_count, attempt - 1);

        let before = Utc::now();
        let outcome = scheduler
            .fail(&task_id, "connection timeout", true)
            .await
            .unwrap();
        let FailOutcome::Retried {
            retry_count,
            visible_at,
        } = outcome
        else {
            panic!("第{attempt}次失败应安排重试，实际: {outcome:?}");
        };
        assert_eq!(retry_count, attempt);

        // 退避延迟严格递增
        let delay = (visible_at - before).num_seconds();
        assert!(
            delay > previous_delay,
            "第{attempt}次退避 {delay}s 应大于上一次 {previous_delay}s"
        );
        previous_delay = delay;

        // 到期前对出队不可见
        assert!(scheduler.next("worker-1").await.unwrap().is_none());
        // 模拟时间流逝：直接用可见时间提升
        assert_eq!(repo.promote_due(visible_at).await.unwrap(), 1);
    }

    // 重试耗尽后的第4次失败进入最终失败归档
    scheduler.next("worker-1").await.unwrap().unwrap();
    let outcome = scheduler
        .fail(&task_id, "connection timeout", true)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::TerminalFailed);

    match scheduler.find(&task_id).await.unwrap().unwrap() {
        TaskStateView::Failed(record) => {
            assert_eq!(record.retry_count, 3);
            assert_eq!(record.task.status, TaskStatus::Failed);
        }
        other => panic!("应为最终失败归档，实际: {other:?}"),
    }
}

#[tokio::test]
async fn test_non_retryable_failure_is_terminal() {
    let (_repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::Normal);
    let task_id = t.task_id.clone();
    scheduler.submit(t).await.unwrap();
    scheduler.next("w").await.unwrap().unwrap();

    let outcome = scheduler.fail(&task_id, "bad params", false).await.unwrap();
    assert_eq!(outcome, FailOutcome::TerminalFailed);
}

#[tokio::test]
async fn test_fail_unknown_task_is_not_processing() {
    let (_repo, scheduler) = scheduler();
    let outcome = scheduler.fail("no-such-task", "boom", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::NotProcessing);
}

#[tokio::test]
async fn test_terminal_state_is_exactly_one() {
    let (_repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::Normal);
    let task_id = t.task_id.clone();
    scheduler.submit(t).await.unwrap();

    // 完成前必须经过处理中
    scheduler.next("w").await.unwrap().unwrap();
    assert!(matches!(
        scheduler.find(&task_id).await.unwrap(),
        Some(TaskStateView::Processing(_))
    ));

    scheduler.complete(&task_id, json!({})).await.unwrap();
    assert!(matches!(
        scheduler.find(&task_id).await.unwrap(),
        Some(TaskStateView::Completed(_))
    ));

    // 完成后fail无处可作用：任务不再处于处理中
    let outcome = scheduler.fail(&task_id, "late failure", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::NotProcessing);
}

#[tokio::test]
async fn test_stats_reflect_lifecycle() {
    let (_repo, scheduler) = scheduler();
    let t1 = task("adaptive", "https://a/1", TaskPriority::Urgent);
    let t2 = task("adaptive", "https://a/2", TaskPriority::Normal);
    let id1 = t1.task_id.clone();

    scheduler.submit(t1).await.unwrap();
    scheduler.submit(t2).await.unwrap();

    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.counters.get("tasks_submitted"), Some(&2));
    assert_eq!(stats.total_queue_size, 2);

    scheduler.next("w").await.unwrap().unwrap();
    scheduler.complete(&id1, json!({})).await.unwrap();

    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.counters.get("tasks_completed"), Some(&1));
    assert_eq!(stats.counters.get("tasks_processing"), Some(&0));
    assert_eq!(stats.total_queue_size, 1);
    assert_eq!(stats.queue_sizes.get("normal"), Some(&1));
    assert_eq!(stats.processing_count, 0);
}

#[tokio::test]
async fn test_purge_completed_respects_cutoff() {
    let (_repo, scheduler) = scheduler();
    let t = task("adaptive", "https://a/1", TaskPriority::Normal);
    let task_id = t.task_id.clone();
    scheduler.submit(t).await.unwrap();
    scheduler.next("w").await.unwrap().unwrap();
    scheduler.complete(&task_id, json!({})).await.unwrap();

    // 刚完成的任务在保留期内，不应清理
    assert_eq!(
        scheduler
            .purge_completed(chrono::Duration::hours(24))
            .await
            .unwrap(),
        0
    );
    // 零保留期立即清理
    assert_eq!(
        scheduler
            .purge_completed(chrono::Duration::zero())
            .await
            .unwrap(),
        1
    );
}
