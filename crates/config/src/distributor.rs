use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crawler_core::{CrawlerError, CrawlerResult};
use crawler_domain::{ConfigRepository, ConfigUpdateNotice, ConfigVersion};

/// 配置变更回调
pub type ConfigCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// 单个配置的版本摘要
#[derive(Debug, Clone, Serialize)]
pub struct ConfigVersionInfo {
    pub version: u64,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
}

/// 配置热更新分发器
///
/// 从配置目录递归发现文档，校验和变化时生成新的单调版本并通过
/// 存储的pub/sub广播。传播是推通知+拉内容：错过通知的进程在
/// 下一次get时惰性对齐——最终一致，不承诺即时一致。
pub struct ConfigDistributor {
    dirs: Vec<PathBuf>,
    debounce: Duration,
    repo: Arc<dyn ConfigRepository>,
    cache: RwLock<HashMap<String, ConfigVersion>>,
    callbacks: RwLock<HashMap<String, Vec<ConfigCallback>>>,
}

impl ConfigDistributor {
    pub fn new(dirs: Vec<PathBuf>, debounce: Duration, repo: Arc<dyn ConfigRepository>) -> Self {
        Self {
            dirs,
            debounce,
            repo,
            cache: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// 递归加载所有配置目录，返回实际产生新版本的文档数
    pub async fn load_all(&self) -> CrawlerResult<usize> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            if !dir.exists() {
                warn!("配置目录不存在: {}", dir.display());
                continue;
            }
            collect_config_files(dir, &mut files);
        }

        let mut changed = 0;
        for path in files {
            match self.load_file(&path).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    // 旧版本保持生效，坏文档不激活
                    error!("加载配置文件失败 {}: {}", path.display(), e);
                }
            }
        }
        Ok(changed)
    }

    /// 加载单个配置文件，校验和未变化时为no-op
    pub async fn load_file(&self, path: &Path) -> CrawlerResult<bool> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CrawlerError::config_load(path.display().to_string(), e.to_string())
        })?;
        let parsed = parse_document(path, &content)?;

        let name = self.config_name(path);
        let checksum = hex::encode(Sha256::digest(content.as_bytes()));

        // 先查本地缓存，再查存储中的最新版
        let current = {
            let cache = self.cache.read().await;
            cache.get(&name).cloned()
        };
        let current = match current {
            Some(v) => Some(v),
            None => self.repo.latest(&name).await?,
        };

        if let Some(ref current) = current {
            if current.checksum == checksum {
                debug!("配置文件无变更: {}", name);
                return Ok(false);
            }
        }

        let version = ConfigVersion {
            config_name: name.clone(),
            version: current.map(|c| c.version + 1).unwrap_or(1),
            checksum,
            updated_at: Utc::now(),
            content: parsed,
        };

        self.repo.store_version(&version).await?;
        self.repo
            .publish_update(&ConfigUpdateNotice {
                config_name: name.clone(),
                version: version.version,
                timestamp: version.updated_at,
            })
            .await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(name.clone(), version.clone());
        }
        self.trigger_callbacks(&name, &version.content).await;

        info!("配置文件加载成功: {} (版本: {})", name, version.version);
        Ok(true)
    }

    /// 逻辑名：相对配置目录的路径去掉扩展名
    fn config_name(&self, path: &Path) -> String {
        for dir in &self.dirs {
            if let Ok(relative) = path.strip_prefix(dir) {
                let without_ext = relative.with_extension("");
                return without_ext.to_string_lossy().replace('\\', "/");
            }
        }
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    /// 获取配置内容
    ///
    /// 缓存命中直接返回；未命中时从存储拉取并回填缓存，
    /// 这就是错过通知后的惰性对齐路径。
    pub async fn get(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> CrawlerResult<Option<serde_json::Value>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(name) {
                match version {
                    None => return Ok(Some(cached.content.clone())),
                    Some(v) if v == cached.version => return Ok(Some(cached.content.clone())),
                    Some(_) => {}
                }
            }
        }

        match version {
            Some(v) => self.repo.content(name, v).await,
            None => match self.repo.latest(name).await? {
                Some(latest) => {
                    let content = latest.content.clone();
                    let mut cache = self.cache.write().await;
                    cache.insert(name.to_string(), latest);
                    Ok(Some(content))
                }
                None => {
                    warn!("配置不存在: {}", name);
                    Ok(None)
                }
            },
        }
    }

    /// 注册本地回调，本地加载与远端通知都会触发
    pub async fn subscribe(&self, name: &str, callback: ConfigCallback) {
        let mut callbacks = self.callbacks.write().await;
        callbacks.entry(name.to_string()).or_default().push(callback);
        info!("注册配置回调: {}", name);
    }

    async fn trigger_callbacks(&self, name: &str, content: &serde_json::Value) {
        let callbacks = self.callbacks.read().await;
        if let Some(list) = callbacks.get(name) {
            for callback in list {
                callback(content);
            }
        }
    }

    /// 监听远端配置更新通知
    ///
    /// 收到通知后拉取内容、回填缓存并触发回调。缓存已达到该
    /// 版本时跳过（本进程自己发布的更新已在load_file中处理）。
    pub fn start_update_listener(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = match self.repo.subscribe_updates().await {
                Ok(rx) => rx,
                Err(e) => {
                    error!("订阅配置更新失败: {}", e);
                    return;
                }
            };
            info!("开始订阅配置更新");

            while let Some(notice) = rx.recv().await {
                let already_current = {
                    let cache = self.cache.read().await;
                    cache
                        .get(&notice.config_name)
                        .map(|c| c.version >= notice.version)
                        .unwrap_or(false)
                };
                if already_current {
                    continue;
                }

                debug!(
                    "收到配置更新通知: {} v{}",
                    notice.config_name, notice.version
                );
                match self.repo.latest(&notice.config_name).await {
                    Ok(Some(latest)) => {
                        let content = latest.content.clone();
                        {
                            let mut cache = self.cache.write().await;
                            cache.insert(notice.config_name.clone(), latest);
                        }
                        self.trigger_callbacks(&notice.config_name, &content).await;
                    }
                    Ok(None) => {
                        warn!("通知指向的配置不存在: {}", notice.config_name);
                    }
                    Err(e) => {
                        error!("拉取配置 {} 失败: {}", notice.config_name, e);
                    }
                }
            }
        })
    }

    /// 监控配置目录的文件变更
    ///
    /// 事件在防抖窗口内合并，只重载受影响的文档。
    pub fn start_watching(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> CrawlerResult<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("文件监控事件错误: {}", e),
            },
        )
        .map_err(|e| CrawlerError::Configuration(format!("创建文件监控失败: {e}")))?;

        for dir in &self.dirs {
            if dir.exists() {
                watcher
                    .watch(dir, RecursiveMode::Recursive)
                    .map_err(|e| {
                        CrawlerError::Configuration(format!(
                            "监控配置目录 {} 失败: {e}",
                            dir.display()
                        ))
                    })?;
                info!("开始监控配置目录: {}", dir.display());
            }
        }

        let handle = tokio::spawn(async move {
            // watcher随任务存活，任务退出即停止监控
            let _watcher = watcher;
            let mut last_seen: HashMap<PathBuf, Instant> = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("文件监控已停止");
                        break;
                    }
                    event = rx.recv() => {
                        let Some(path) = event else { break };
                        if !is_config_file(&path) {
                            continue;
                        }

                        // 防抖：窗口内的重复事件合并为一次
                        let now = Instant::now();
                        if let Some(last) = last_seen.get(&path) {
                            if now.duration_since(*last) < self.debounce {
                                continue;
                            }
                        }
                        last_seen.insert(path.clone(), now);

                        info!("检测到配置文件变更: {}", path.display());
                        if let Err(e) = self.load_file(&path).await {
                            error!("重新加载配置文件失败 {}: {}", path.display(), e);
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    /// 删除指定配置最新keep个版本之外的归档
    pub async fn prune(&self, name: &str, keep: usize) -> CrawlerResult<u64> {
        let removed = self.repo.prune(name, keep).await?;
        if removed > 0 {
            info!("清理配置 {} 的 {} 个旧版本", name, removed);
        }
        Ok(removed)
    }

    /// 所有配置的版本摘要
    pub async fn versions_summary(&self) -> CrawlerResult<HashMap<String, ConfigVersionInfo>> {
        let mut summary = HashMap::new();
        for name in self.repo.names().await? {
            if let Some(latest) = self.repo.latest(&name).await? {
                summary.insert(
                    name,
                    ConfigVersionInfo {
                        version: latest.version,
                        checksum: latest.checksum,
                        updated_at: latest.updated_at,
                    },
                );
            }
        }
        Ok(summary)
    }
}

/// 支持的配置文档格式
fn is_config_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml") | Some("json")
    )
}

fn collect_config_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取配置目录失败 {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true)
        {
            continue;
        }
        if path.is_dir() {
            collect_config_files(&path, files);
        } else if is_config_file(&path) {
            files.push(path);
        }
    }
}

fn parse_document(path: &Path, content: &str) -> CrawlerResult<serde_json::Value> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            let value: toml::Value = toml::from_str(content).map_err(|e| {
                CrawlerError::config_load(path.display().to_string(), format!("TOML解析错误: {e}"))
            })?;
            serde_json::to_value(value).map_err(|e| {
                CrawlerError::config_load(path.display().to_string(), e.to_string())
            })
        }
        Some("json") => serde_json::from_str(content).map_err(|e| {
            CrawlerError::config_load(path.display().to_string(), format!("JSON解析错误: {e}"))
        }),
        other => Err(CrawlerError::config_load(
            path.display().to_string(),
            format!("不支持的配置文件格式: {other:?}"),
        )),
    }
}
