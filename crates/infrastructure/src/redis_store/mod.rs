pub mod config_repo;
pub mod connection;
pub mod metrics;
pub mod task_queue;
pub mod worker_registry;

pub use config_repo::RedisConfigRepository;
pub use connection::RedisStore;
pub use metrics::RedisMetricsRepository;
pub use task_queue::RedisTaskQueueRepository;
pub use worker_registry::RedisWorkerRegistryRepository;
