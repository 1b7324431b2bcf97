use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 应用配置
///
/// 进程级静态配置，与通过共享存储分发的业务配置（站点规则等）互相独立。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub scheduler: SchedulerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub monitor: MonitorConfig,
    pub worker: WorkerConfig,
    pub config_watch: ConfigWatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// 连接URL，如 redis://127.0.0.1:6379/0
    pub url: String,
    /// 单条命令的响应超时（毫秒），独立于任务级重试
    pub response_timeout_ms: u64,
    /// 单次命令失败后的最大重试次数
    pub max_retry_attempts: u32,
    /// 重试间隔（毫秒），实际间隔带随机抖动
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 基础重试间隔（秒）
    pub retry_base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub retry_max_interval_seconds: u64,
    /// 指数退避倍数
    pub retry_backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0，0表示关闭抖动）
    pub retry_jitter_factor: f64,
    /// 延迟任务提升检查间隔（秒）
    pub promote_interval_seconds: u64,
    /// 失联Worker任务回收检查间隔（秒）
    pub recovery_sweep_interval_seconds: u64,
    /// 已完成归档保留时长（小时）
    pub completed_retention_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// 心跳存活窗口（秒），超过视为离线
    pub liveness_window_seconds: i64,
    /// CPU饱和阈值（百分比）
    pub cpu_saturation_percent: f64,
    /// 内存饱和阈值（百分比）
    pub memory_saturation_percent: f64,
    /// 离线Worker清理检查间隔（秒）
    pub reap_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 单任务最大执行时长（秒），超过触发告警
    pub task_duration_max_seconds: i64,
    /// 单任务最大内存占用（MB）
    pub memory_usage_max_mb: f64,
    /// 单任务最大CPU占用（百分比）
    pub cpu_usage_max_percent: f64,
    /// 指标保留时长（天），仅在显式清理时生效
    pub retention_days: i64,
    /// 告警查询默认回看窗口（小时）
    pub alert_lookback_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Worker唯一标识，留空则按主机名生成
    pub worker_id: String,
    /// 支持的附加能力标记（如 javascript、selenium）
    pub features: Vec<String>,
    /// 并发执行上限
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_seconds: u64,
    /// 单个外部任务的墙钟超时（秒）
    pub task_timeout_seconds: u64,
    /// 停机时等待活跃任务的宽限期（秒）
    pub drain_grace_seconds: u64,
    /// 按任务类型配置的外部执行器命令
    #[serde(default)]
    pub executors: HashMap<String, ExecutorCommand>,
}

/// 外部任务执行器的启动命令模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWatchConfig {
    /// 被监控的配置目录（递归）
    pub dirs: Vec<String>,
    /// 文件变更防抖窗口（毫秒）
    pub debounce_ms: u64,
    /// prune时每个配置保留的版本数
    pub keep_versions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379/0".to_string(),
                response_timeout_ms: 5000,
                max_retry_attempts: 3,
                retry_delay_ms: 500,
            },
            scheduler: SchedulerConfig {
                retry_base_interval_seconds: 60,
                retry_max_interval_seconds: 3600,
                retry_backoff_multiplier: 2.0,
                retry_jitter_factor: 0.1,
                promote_interval_seconds: 10,
                recovery_sweep_interval_seconds: 60,
                completed_retention_hours: 24,
            },
            load_balancer: LoadBalancerConfig {
                liveness_window_seconds: 300,
                cpu_saturation_percent: 90.0,
                memory_saturation_percent: 90.0,
                reap_interval_seconds: 60,
            },
            monitor: MonitorConfig {
                task_duration_max_seconds: 3600,
                memory_usage_max_mb: 1024.0,
                cpu_usage_max_percent: 90.0,
                retention_days: 7,
                alert_lookback_hours: 24,
            },
            worker: WorkerConfig {
                enabled: false,
                worker_id: String::new(),
                features: vec!["basic_crawling".to_string()],
                max_concurrent_tasks: 3,
                heartbeat_interval_seconds: 30,
                poll_interval_seconds: 5,
                task_timeout_seconds: 3600,
                drain_grace_seconds: 60,
                executors: HashMap::new(),
            },
            config_watch: ConfigWatchConfig {
                dirs: vec!["config".to_string()],
                debounce_ms: 1000,
                keep_versions: 5,
            },
        }
    }
}

impl AppConfig {
    /// 加载配置文件，环境变量（CRAWLER_前缀）优先级最高
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {path}"));
            }
        } else {
            for path in ["config/crawler.toml", "crawler.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let defaults = toml::to_string(&AppConfig::default())?;
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(&defaults, FileFormat::Toml))
            .add_source(builder.build()?)
            .add_source(
                Environment::with_prefix("CRAWLER")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?.try_deserialize::<AppConfig>()?;
        Ok(config)
    }

    /// 实际生效的Worker ID，配置为空时按主机名派生
    pub fn effective_worker_id(&self) -> String {
        if !self.worker.worker_id.is_empty() {
            return self.worker.worker_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("worker-{}-{}", host, std::process::id())
    }
}
