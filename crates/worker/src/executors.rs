use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crawler_core::{CrawlerError, CrawlerResult, ExecutorCommand};
use crawler_domain::CrawlTask;

/// 外部执行器在stdout上输出计数行的前缀
///
/// 形如 `CRAWL_STATS {"items_scraped": 10, "pages_crawled": 2}`，
/// 解析是尽力而为的，最后一条有效记录生效。
const STATS_LINE_PREFIX: &str = "CRAWL_STATS ";

/// 执行器自报的计数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecCounters {
    #[serde(default)]
    pub items_scraped: u64,
    #[serde(default)]
    pub pages_crawled: u64,
    #[serde(default)]
    pub errors_count: u64,
}

/// 一次外部任务执行的结果
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub counters: ExecCounters,
    pub error: Option<String>,
}

/// 任务执行器边界
///
/// 对核心而言执行器是不透明的：启动、等待、解释退出状态与
/// 自报计数。墙钟超时由Worker侧统一施加，不在执行器内实现。
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, task: &CrawlTask, worker_id: &str) -> CrawlerResult<ExecutionReport>;

    fn name(&self) -> &str;
}

/// 进程执行器
///
/// 退出码0视为成功；任务标识与参数包通过环境变量传入子进程。
/// kill_on_drop保证超时丢弃执行Future时子进程被终止。
pub struct ProcessExecutor {
    job_kind: String,
    command: ExecutorCommand,
}

impl ProcessExecutor {
    pub fn new(job_kind: impl Into<String>, command: ExecutorCommand) -> Self {
        Self {
            job_kind: job_kind.into(),
            command,
        }
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, task: &CrawlTask, worker_id: &str) -> CrawlerResult<ExecutionReport> {
        let params = serde_json::to_string(&task.parameters)?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env("CRAWL_TASK_ID", &task.task_id)
            .env("CRAWL_WORKER_ID", worker_id)
            .env("CRAWL_TARGET", &task.target)
            .env("CRAWL_PARAMS", params)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            "执行命令: {} {} (任务: {})",
            self.command.program,
            self.command.args.join(" "),
            task.task_id
        );

        let child = command.spawn().map_err(|e| {
            CrawlerError::TaskExecution(format!(
                "启动执行器 {} 失败: {e}",
                self.command.program
            ))
        })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CrawlerError::TaskExecution(format!("等待执行器进程失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let counters = parse_stats_output(&stdout);

        if output.status.success() {
            debug!("执行器正常退出 (任务: {})", task.task_id);
            Ok(ExecutionReport {
                success: true,
                counters,
                error: None,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            Ok(ExecutionReport {
                success: false,
                counters,
                error: Some(format!(
                    "执行器退出码: {} ({})",
                    output.status.code().unwrap_or(-1),
                    tail
                )),
            })
        }
    }

    fn name(&self) -> &str {
        &self.job_kind
    }
}

/// 解析执行器stdout中的计数行，最后一条有效记录生效
pub fn parse_stats_output(output: &str) -> ExecCounters {
    let mut counters = ExecCounters::default();
    for line in output.lines() {
        if let Some(payload) = line.trim().strip_prefix(STATS_LINE_PREFIX) {
            match serde_json::from_str::<ExecCounters>(payload) {
                Ok(parsed) => counters = parsed,
                Err(e) => warn!("无法解析执行器计数行: {e}"),
            }
        }
    }
    counters
}

/// 按任务类型注册的执行器集合
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按进程命令模板批量构建
    pub fn from_commands(commands: &HashMap<String, ExecutorCommand>) -> Self {
        let mut registry = Self::new();
        for (kind, command) in commands {
            registry.register(kind, Arc::new(ProcessExecutor::new(kind, command.clone())));
        }
        registry
    }

    pub fn register(&mut self, job_kind: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(job_kind.into(), executor);
    }

    pub fn get(&self, job_kind: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_kind).cloned()
    }

    pub fn contains(&self, job_kind: &str) -> bool {
        self.executors.contains_key(job_kind)
    }

    /// 已注册的任务类型，构成Worker声明的能力
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort_unstable();
        kinds
    }
}
