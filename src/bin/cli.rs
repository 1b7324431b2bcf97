use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;

use crawler_config::ConfigDistributor;
use crawler_core::AppConfig;
use crawler_dispatcher::{
    AlertThresholds, LoadBalancer, LoadBalancerSettings, RetryPolicy, TaskMonitor, TaskScheduler,
};
use crawler_domain::{
    ConfigRepository, CrawlTask, MetricsRepository, TaskPriority, TaskQueueRepository,
    WorkerRegistryRepository,
};
use crawler_infrastructure::{
    RedisConfigRepository, RedisMetricsRepository, RedisStore, RedisTaskQueueRepository,
    RedisWorkerRegistryRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = CliApp::parse();
    cli.run().await
}

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "crawlctl")]
#[command(version = "1.0.0")]
#[command(about = "分布式爬虫任务调度系统 - 命令行管理工具")]
#[command(long_about = "直接面向共享存储的管理接口：任务提交与查询、统计、告警、配置与指标维护")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long, default_value = "config/crawler.toml")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 任务管理
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// 调度器、负载均衡与执行统计
    Stats,
    /// Worker注册表
    Workers,
    /// 最近告警
    Alerts {
        /// 回看窗口（小时），缺省取monitor.alert_lookback_hours
        #[arg(long)]
        hours: Option<i64>,
    },
    /// 配置管理
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// 指标管理
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// 提交单个任务
    Submit {
        /// 任务类型（决定Worker侧执行器）
        job_kind: String,
        /// 抓取目标
        target: String,
        /// 优先级: low/normal/high/urgent
        #[arg(long, default_value = "normal")]
        priority: String,
        /// 传给执行器的参数包（JSON对象）
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// 从JSON文件批量提交
    Batch {
        /// 任务数组文件
        file: PathBuf,
    },
    /// 查询任务归档状态
    Status {
        task_id: String,
    },
    /// 清理已完成归档
    PurgeCompleted {
        /// 保留时长（小时），缺省取scheduler.completed_retention_hours
        #[arg(long)]
        hours: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// 强制重新加载配置目录
    Reload,
    /// 各配置的当前版本
    Versions,
    /// 清理旧版本
    Prune {
        name: String,
        /// 保留的版本数，缺省取config_watch.keep_versions
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum MetricsCommands {
    /// 清理超出保留期的任务指标
    Cleanup {
        /// 保留天数，缺省取monitor.retention_days
        #[arg(long)]
        days: Option<i64>,
    },
}

/// 批量提交文件中的任务描述
#[derive(Debug, Deserialize)]
struct BatchTaskSpec {
    job_kind: String,
    #[serde(default)]
    target: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default = "default_params")]
    parameters: serde_json::Value,
    max_retries: Option<u32>,
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_params() -> serde_json::Value {
    json!({})
}

/// 所有子命令共享的服务装配
struct AdminContext {
    config: AppConfig,
    scheduler: TaskScheduler,
    balancer: LoadBalancer,
    monitor: TaskMonitor,
    distributor: ConfigDistributor,
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let config = if std::path::Path::new(&self.config).exists() {
            AppConfig::load(Some(&self.config))
                .with_context(|| format!("加载配置文件失败: {}", self.config))?
        } else {
            AppConfig::load(None).context("加载默认配置失败")?
        };

        let ctx = AdminContext::connect(&config).await?;

        match self.command {
            Commands::Task { command } => ctx.handle_task(command).await,
            Commands::Stats => ctx.handle_stats().await,
            Commands::Workers => ctx.handle_workers().await,
            Commands::Alerts { hours } => ctx.handle_alerts(hours).await,
            Commands::Config { command } => ctx.handle_config(command).await,
            Commands::Metrics { command } => ctx.handle_metrics(command).await,
        }
    }
}

impl AdminContext {
    async fn connect(config: &AppConfig) -> Result<Self> {
        let store = Arc::new(
            RedisStore::connect(config.redis.clone())
                .await
                .context("连接共享存储失败")?,
        );

        let tasks: Arc<dyn TaskQueueRepository> =
            Arc::new(RedisTaskQueueRepository::new(store.clone()));
        let workers: Arc<dyn WorkerRegistryRepository> =
            Arc::new(RedisWorkerRegistryRepository::new(store.clone()));
        let metrics: Arc<dyn MetricsRepository> =
            Arc::new(RedisMetricsRepository::new(store.clone()));
        let config_repo: Arc<dyn ConfigRepository> =
            Arc::new(RedisConfigRepository::new(store.clone()));

        Ok(Self {
            config: config.clone(),
            scheduler: TaskScheduler::new(tasks, RetryPolicy::from_config(&config.scheduler)),
            balancer: LoadBalancer::new(
                workers,
                LoadBalancerSettings::from_config(&config.load_balancer),
            ),
            monitor: TaskMonitor::new(metrics, AlertThresholds::from_config(&config.monitor)),
            distributor: ConfigDistributor::new(
                config.config_watch.dirs.iter().map(PathBuf::from).collect(),
                Duration::from_millis(config.config_watch.debounce_ms),
                config_repo,
            ),
        })
    }

    async fn handle_task(&self, command: TaskCommands) -> Result<()> {
        match command {
            TaskCommands::Submit {
                job_kind,
                target,
                priority,
                params,
                max_retries,
            } => {
                let priority: TaskPriority =
                    priority.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                let parameters = match params {
                    Some(raw) => serde_json::from_str(&raw).context("参数包不是合法JSON")?,
                    None => json!({}),
                };

                let task = CrawlTask::new(job_kind, target, priority, parameters)
                    .with_max_retries(max_retries);
                let task_id = task.task_id.clone();

                if self.scheduler.submit(task).await? {
                    println!("任务提交成功: {task_id}");
                } else {
                    println!("任务已存在，提交被拒绝: {task_id}");
                }
            }
            TaskCommands::Batch { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("读取批量文件失败: {}", file.display()))?;
                let specs: Vec<BatchTaskSpec> =
                    serde_json::from_str(&raw).context("批量文件不是任务数组")?;

                let mut batch = Vec::with_capacity(specs.len());
                for spec in specs {
                    let priority: TaskPriority = spec
                        .priority
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?;
                    let mut task =
                        CrawlTask::new(spec.job_kind, spec.target, priority, spec.parameters);
                    if let Some(max_retries) = spec.max_retries {
                        task = task.with_max_retries(max_retries);
                    }
                    batch.push(task);
                }

                let total = batch.len();
                let accepted = self.scheduler.submit_batch(batch).await?;
                println!("批量提交完成: 接受 {accepted}/{total}");
            }
            TaskCommands::Status { task_id } => match self.scheduler.find(&task_id).await? {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => println!("任务不存在: {task_id}"),
            },
            TaskCommands::PurgeCompleted { hours } => {
                let hours = hours.unwrap_or(self.config.scheduler.completed_retention_hours);
                let removed = self
                    .scheduler
                    .purge_completed(chrono::Duration::hours(hours))
                    .await?;
                println!("清理了 {removed} 个已完成超过{hours}小时的任务归档");
            }
        }
        Ok(())
    }

    async fn handle_stats(&self) -> Result<()> {
        let overview = json!({
            "scheduler": self.scheduler.stats().await?,
            "load_balancer": self.balancer.stats().await?,
            "performance": self.monitor.performance().await?,
            "worker_performance": self.monitor.worker_performance(None).await?,
        });
        println!("{}", serde_json::to_string_pretty(&overview)?);
        Ok(())
    }

    async fn handle_workers(&self) -> Result<()> {
        let workers = self.balancer.list_workers().await?;
        println!("{}", serde_json::to_string_pretty(&workers)?);
        Ok(())
    }

    async fn handle_alerts(&self, hours: Option<i64>) -> Result<()> {
        let hours = hours.unwrap_or(self.config.monitor.alert_lookback_hours);
        let alerts = self.monitor.recent_alerts(hours).await?;
        if alerts.is_empty() {
            println!("最近{hours}小时无告警");
        } else {
            println!("{}", serde_json::to_string_pretty(&alerts)?);
        }
        Ok(())
    }

    async fn handle_config(&self, command: ConfigCommands) -> Result<()> {
        match command {
            ConfigCommands::Reload => {
                let changed = self.distributor.load_all().await?;
                println!("重新加载完成，{changed} 个配置产生新版本");
            }
            ConfigCommands::Versions => {
                let summary = self.distributor.versions_summary().await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            ConfigCommands::Prune { name, keep } => {
                let keep = keep.unwrap_or(self.config.config_watch.keep_versions);
                let removed = self.distributor.prune(&name, keep).await?;
                println!("清理配置 {name} 的 {removed} 个旧版本");
            }
        }
        Ok(())
    }

    async fn handle_metrics(&self, command: MetricsCommands) -> Result<()> {
        match command {
            MetricsCommands::Cleanup { days } => {
                let days = days.unwrap_or(self.config.monitor.retention_days);
                let removed = self.monitor.cleanup(days).await?;
                println!("清理了 {removed} 个超出保留期的任务指标");
            }
        }
        Ok(())
    }
}
