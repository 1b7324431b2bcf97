pub mod config;
pub mod constants;
pub mod errors;

pub use config::*;
pub use errors::*;

/// 统一的Result类型
pub type CrawlerResult<T> = std::result::Result<T, CrawlerError>;
