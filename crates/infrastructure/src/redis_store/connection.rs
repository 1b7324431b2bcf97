use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, FromRedisValue};
use tokio::time::sleep;
use tracing::{debug, warn};

use crawler_core::{CrawlerError, CrawlerResult, RedisConfig};

/// 共享存储连接
///
/// 持有自动重连的连接管理器；单命令失败时在本层做带抖动的
/// 有界重试，与任务级重试互相独立。
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    config: RedisConfig,
}

impl RedisStore {
    pub async fn connect(config: RedisConfig) -> CrawlerResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CrawlerError::Store(format!("Failed to create Redis client: {e}")))?;
        // 存储往返有自己的短超时，与任务级重试互相独立
        let manager_config = ConnectionManagerConfig::new()
            .set_response_timeout(Duration::from_millis(config.response_timeout_ms));
        let manager = ConnectionManager::new_with_config(client.clone(), manager_config)
            .await
            .map_err(|e| CrawlerError::Store(format!("Failed to connect to Redis: {e}")))?;

        let store = Self {
            client,
            manager,
            config,
        };
        store.ping().await?;
        debug!("Successfully connected to Redis at {}", store.config.url);
        Ok(store)
    }

    /// pub/sub需要独占连接，由调用方从client单独建立
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub async fn ping(&self) -> CrawlerResult<()> {
        let mut conn = self.manager.clone();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CrawlerError::Store(format!("Redis PING failed: {e}")))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(CrawlerError::Store(format!(
                "Unexpected PING response: {response}"
            )))
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Redis health check failed: {}", e);
                false
            }
        }
    }

    /// 执行单条命令，失败时带抖动重试
    pub async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> CrawlerResult<T> {
        let mut last_error = None;

        for attempt in 0..self.config.max_retry_attempts.max(1) {
            let mut conn = self.manager.clone();
            match cmd.query_async::<T>(&mut conn).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Redis command succeeded after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_retry_attempts {
                        let delay = self.jittered_delay();
                        warn!(
                            "Redis command failed (attempt {}/{}): {}. Retrying in {:?}...",
                            attempt + 1,
                            self.config.max_retry_attempts,
                            last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                            delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(CrawlerError::Store(format!(
            "Redis command failed after {} attempts: {}",
            self.config.max_retry_attempts,
            last_error.map_or("unknown".to_string(), |e| e.to_string())
        )))
    }

    /// 执行Lua脚本，重试语义与query一致
    pub async fn invoke_script<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> CrawlerResult<T> {
        let mut last_error = None;

        for attempt in 0..self.config.max_retry_attempts.max(1) {
            let mut conn = self.manager.clone();
            match invocation.invoke_async::<T>(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_retry_attempts {
                        sleep(self.jittered_delay()).await;
                    }
                }
            }
        }

        Err(CrawlerError::Store(format!(
            "Redis script failed after {} attempts: {}",
            self.config.max_retry_attempts,
            last_error.map_or("unknown".to_string(), |e| e.to_string())
        )))
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.config.retry_delay_ms as f64;
        let jitter = base * 0.5 * rand::random::<f64>();
        Duration::from_millis((base + jitter) as u64)
    }
}
