use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 任务优先级，出队时严格按 Urgent -> Low 顺序扫描
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// 出队扫描顺序（高优先级在前）
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// 队列键后缀，与存储中的序列化形式保持一致
    pub fn queue_suffix(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(format!("未知的优先级: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

/// 爬虫任务
///
/// 提交后由调度器独占所有权，Worker在执行期间只持有只读副本。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlTask {
    /// 内容派生的任务ID
    pub task_id: String,
    /// 任务类型，决定Worker侧使用哪个外部执行器
    pub job_kind: String,
    /// 抓取目标（URL或逻辑键），可为空
    pub target: String,
    pub priority: TaskPriority,
    /// 透传给外部执行器的参数包
    pub parameters: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// 延迟重试的可见时间，在此之前任务对出队不可见
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// 自由扩展字段，边界处校验为JSON对象
    pub metadata: serde_json::Value,
}

impl CrawlTask {
    pub fn new(
        job_kind: impl Into<String>,
        target: impl Into<String>,
        priority: TaskPriority,
        parameters: serde_json::Value,
    ) -> Self {
        let mut task = Self {
            task_id: String::new(),
            job_kind: job_kind.into(),
            target: target.into(),
            priority,
            parameters,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            scheduled_at: None,
            status: TaskStatus::Pending,
            metadata: serde_json::Value::Object(Default::default()),
        };
        task.task_id = task.derive_task_id();
        task
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// 任务标识符：target为空时退化为参数包中的site字段
    pub fn identifier(&self) -> &str {
        if !self.target.is_empty() {
            return &self.target;
        }
        self.parameters
            .get("site")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
    }

    /// 基于内容计算任务ID
    pub fn derive_task_id(&self) -> String {
        let content = format!(
            "{}:{}:{}",
            self.job_kind,
            self.identifier(),
            self.created_at.timestamp_micros()
        );
        let digest = Sha256::digest(content.as_bytes());
        hex::encode(digest)
    }

    /// target被改写后需要重新生成ID以反映新内容
    pub fn regenerate_task_id(&mut self) {
        self.task_id = self.derive_task_id();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// 处理中任务的记录，绑定Worker与开始时间
///
/// start_time以epoch秒存储，出入队脚本在存储侧写入该字段。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingRecord {
    pub task: CrawlTask,
    pub worker_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub task_id: String,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub task: CrawlTask,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// 任务的当前归档视图，供管理面查询
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskStateView {
    Processing(ProcessingRecord),
    Completed(CompletionRecord),
    Failed(FailureRecord),
}
