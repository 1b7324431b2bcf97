use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("存储错误: {0}")]
    Store(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("任务执行超时: {timeout_seconds}秒")]
    ExecutionTimeout { timeout_seconds: u64 },
    #[error("配置加载错误: {path} - {message}")]
    ConfigLoad { path: String, message: String },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

impl CrawlerError {
    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn config_load<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            message: message.into(),
        }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }

    /// 瞬态错误，调用方可以带抖动退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlerError::Store(_) | CrawlerError::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlerError::Internal(_) | CrawlerError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(err: serde_json::Error) -> Self {
        CrawlerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CrawlerError {
    fn from(err: anyhow::Error) -> Self {
        CrawlerError::Internal(err.to_string())
    }
}
