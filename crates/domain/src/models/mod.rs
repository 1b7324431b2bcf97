pub mod config_version;
pub mod metrics;
pub mod task;
pub mod worker;

pub use config_version::*;
pub use metrics::*;
pub use task::*;
pub use worker::*;
