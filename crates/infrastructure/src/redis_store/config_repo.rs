use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crawler_core::constants::{CONFIG_CONTENT_KEY, CONFIG_UPDATE_CHANNEL, CONFIG_VERSIONS_KEY};
use crawler_core::CrawlerResult;
use crawler_domain::{ConfigRepository, ConfigUpdateNotice, ConfigVersion};

use super::connection::RedisStore;

/// 归档内容的存储保留时长（秒），prune之外的兜底
const CONTENT_TTL_SECONDS: u64 = 30 * 24 * 3600;

pub struct RedisConfigRepository {
    store: Arc<RedisStore>,
}

impl RedisConfigRepository {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }

    fn content_key(name: &str, version: u64) -> String {
        format!("{CONFIG_CONTENT_KEY}:{name}:{version}")
    }

    fn channel(name: &str) -> String {
        format!("{CONFIG_UPDATE_CHANNEL}:{name}")
    }
}

#[async_trait]
impl ConfigRepository for RedisConfigRepository {
    async fn store_version(&self, version: &ConfigVersion) -> CrawlerResult<()> {
        let payload = serde_json::to_string(version)?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(CONFIG_VERSIONS_KEY)
            .arg(&version.config_name)
            .arg(payload);
        let _: i64 = self.store.query(&cmd).await?;

        let content = serde_json::to_string(&version.content)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::content_key(&version.config_name, version.version))
            .arg(content)
            .arg("EX")
            .arg(CONTENT_TTL_SECONDS);
        let _: String = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn latest(&self, name: &str) -> CrawlerResult<Option<ConfigVersion>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(CONFIG_VERSIONS_KEY).arg(name);
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn content(&self, name: &str, version: u64) -> CrawlerResult<Option<serde_json::Value>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(Self::content_key(name, version));
        let raw: Option<String> = self.store.query(&cmd).await?;
        raw.map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn versions(&self, name: &str) -> CrawlerResult<Vec<u64>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(format!("{CONFIG_CONTENT_KEY}:{name}:*"));
        let keys: Vec<String> = self.store.query(&cmd).await?;

        let mut versions: Vec<u64> = keys
            .iter()
            .filter_map(|k| k.rsplit(':').next().and_then(|v| v.parse().ok()))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn names(&self) -> CrawlerResult<Vec<String>> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(CONFIG_VERSIONS_KEY);
        let mut names: Vec<String> = self.store.query(&cmd).await?;
        names.sort_unstable();
        Ok(names)
    }

    async fn prune(&self, name: &str, keep: usize) -> CrawlerResult<u64> {
        let versions = self.versions(name).await?;
        if versions.len() <= keep {
            return Ok(0);
        }

        let drop_count = versions.len() - keep;
        let mut removed = 0u64;
        for version in &versions[..drop_count] {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(Self::content_key(name, *version));
            let deleted: u64 = self.store.query(&cmd).await?;
            removed += deleted;
        }
        debug!("Pruned {} old versions of config {}", removed, name);
        Ok(removed)
    }

    async fn publish_update(&self, notice: &ConfigUpdateNotice) -> CrawlerResult<()> {
        let payload = serde_json::to_string(notice)?;
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(Self::channel(&notice.config_name)).arg(payload);
        let _: i64 = self.store.query(&cmd).await?;
        Ok(())
    }

    async fn subscribe_updates(
        &self,
    ) -> CrawlerResult<mpsc::UnboundedReceiver<ConfigUpdateNotice>> {
        let client = self.store.client();
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| crawler_core::CrawlerError::Store(format!("pubsub connect: {e}")))?;
        pubsub
            .psubscribe(format!("{CONFIG_UPDATE_CHANNEL}:*"))
            .await
            .map_err(|e| crawler_core::CrawlerError::Store(format!("psubscribe: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Failed to read config update payload: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<ConfigUpdateNotice>(&payload) {
                    Ok(notice) => {
                        if tx.send(notice).is_err() {
                            debug!("Config update subscriber dropped, stopping listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Malformed config update notice: {}", e);
                    }
                }
            }
        });

        Ok(rx)
    }
}
