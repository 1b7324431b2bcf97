use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crawler_config::ConfigDistributor;
use crawler_domain::ConfigRepository;
use crawler_infrastructure::MemoryConfigRepository;

fn write(dir: &std::path::Path, rel: &str, content: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

fn distributor(
    dir: &std::path::Path,
) -> (Arc<MemoryConfigRepository>, Arc<ConfigDistributor>) {
    let repo = Arc::new(MemoryConfigRepository::new());
    let distributor = Arc::new(ConfigDistributor::new(
        vec![dir.to_path_buf()],
        Duration::from_millis(200),
        repo.clone(),
    ));
    (repo, distributor)
}

#[tokio::test]
async fn test_load_all_discovers_nested_documents() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "spider_settings.toml", "download_delay = 3");
    write(dir.path(), "sites/bjcdc.json", r#"{"enabled": true}"#);
    write(dir.path(), "notes.md", "not a config");
    write(dir.path(), ".hidden.toml", "x = 1");

    let (repo, distributor) = distributor(dir.path());
    assert_eq!(distributor.load_all().await.unwrap(), 2);

    let mut names = repo.names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["sites/bjcdc", "spider_settings"]);

    let content = distributor.get("sites/bjcdc", None).await.unwrap().unwrap();
    assert_eq!(content["enabled"], true);
}

#[tokio::test]
async fn test_unchanged_content_creates_no_new_version() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "spider_settings.toml", "download_delay = 3");

    let (repo, distributor) = distributor(dir.path());
    let mut notices = repo.subscribe_updates().await.unwrap();

    assert_eq!(distributor.load_all().await.unwrap(), 1);
    // 内容未变：不产生新版本也不广播
    assert_eq!(distributor.load_all().await.unwrap(), 0);

    assert_eq!(repo.versions("spider_settings").await.unwrap(), vec![1]);
    let first = notices.try_recv().unwrap();
    assert_eq!(first.version, 1);
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_content_change_bumps_version_and_notifies_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "spider_settings.toml", "download_delay = 3");

    let (repo, distributor) = distributor(dir.path());
    distributor.load_all().await.unwrap();

    let mut notices = repo.subscribe_updates().await.unwrap();
    std::fs::write(&path, "download_delay = 10").unwrap();
    assert!(distributor.load_file(&path).await.unwrap());

    // 恰好一条通知，版本单调递增
    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.config_name, "spider_settings");
    assert_eq!(notice.version, 2);
    assert!(notices.try_recv().is_err());

    // get不带版本号返回最新内容
    let content = distributor
        .get("spider_settings", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content["download_delay"], 10);

    // 指定历史版本仍可读
    let old = distributor
        .get("spider_settings", Some(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old["download_delay"], 3);
}

#[tokio::test]
async fn test_malformed_document_keeps_previous_version_current() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "spider_settings.toml", "download_delay = 3");

    let (_repo, distributor) = distributor(dir.path());
    distributor.load_all().await.unwrap();

    std::fs::write(&path, "download_delay = = broken").unwrap();
    assert!(distributor.load_file(&path).await.is_err());
    // load_all跳过坏文档而不是失败
    assert_eq!(distributor.load_all().await.unwrap(), 0);

    let content = distributor
        .get("spider_settings", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content["download_delay"], 3);
}

#[tokio::test]
async fn test_local_subscribers_fire_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "spider_settings.toml", "download_delay = 3");

    let (_repo, distributor) = distributor(dir.path());
    let (tx, rx) = std::sync::mpsc::channel::<serde_json::Value>();
    distributor
        .subscribe(
            "spider_settings",
            Arc::new(move |content| {
                let _ = tx.send(content.clone());
            }),
        )
        .await;

    distributor.load_all().await.unwrap();
    assert_eq!(rx.try_recv().unwrap()["download_delay"], 3);

    std::fs::write(&path, "download_delay = 7").unwrap();
    distributor.load_file(&path).await.unwrap();
    assert_eq!(rx.try_recv().unwrap()["download_delay"], 7);
}

#[tokio::test]
async fn test_remote_notification_propagates_to_other_process() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    // 两个分发器共享同一个存储，模拟两个进程
    let repo = Arc::new(MemoryConfigRepository::new());
    let publisher = Arc::new(ConfigDistributor::new(
        vec![dir_a.path().to_path_buf()],
        Duration::from_millis(200),
        repo.clone(),
    ));
    let subscriber = Arc::new(ConfigDistributor::new(
        vec![dir_b.path().to_path_buf()],
        Duration::from_millis(200),
        repo.clone(),
    ));

    let (tx, rx) = std::sync::mpsc::channel::<serde_json::Value>();
    subscriber
        .subscribe(
            "spider_settings",
            Arc::new(move |content| {
                let _ = tx.send(content.clone());
            }),
        )
        .await;
    let _listener = Arc::clone(&subscriber).start_update_listener();
    tokio::time::sleep(Duration::from_millis(50)).await;

    write(dir_a.path(), "spider_settings.toml", "download_delay = 9");
    publisher.load_all().await.unwrap();

    // 订阅进程收到通知后拉取内容并触发回调
    let received = tokio::task::spawn_blocking(move || {
        rx.recv_timeout(Duration::from_secs(3)).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(received["download_delay"], 9);

    let content = subscriber
        .get("spider_settings", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content["download_delay"], 9);
}

#[tokio::test]
async fn test_prune_keeps_exactly_n_versions() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "spider_settings.toml", "v = 0");

    let (repo, distributor) = distributor(dir.path());
    for round in 0..8 {
        std::fs::write(&path, format!("v = {round}")).unwrap();
        distributor.load_file(&path).await.unwrap();
    }
    assert_eq!(repo.versions("spider_settings").await.unwrap().len(), 8);

    let removed = distributor.prune("spider_settings", 5).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(repo.versions("spider_settings").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_versions_summary() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "spider_settings.toml", "download_delay = 3");
    write(dir.path(), "sites/bjcdc.json", r#"{"enabled": true}"#);

    let (_repo, distributor) = distributor(dir.path());
    distributor.load_all().await.unwrap();

    let summary = distributor.versions_summary().await.unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary["spider_settings"].version, 1);
    assert_eq!(summary["spider_settings"].checksum.len(), 64);
}

#[tokio::test]
async fn test_watch_reloads_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "spider_settings.toml", "download_delay = 3");

    let (_repo, distributor) = distributor(dir.path());
    distributor.load_all().await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = Arc::clone(&distributor).start_watching(shutdown_rx).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(&path, "download_delay = 42").unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let content = distributor
            .get("spider_settings", None)
            .await
            .unwrap()
            .unwrap();
        if content["download_delay"] == json!(42) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "文件变更未在期限内被监控到"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown_tx.send(()).unwrap();
    let _ = handle.await;
}
