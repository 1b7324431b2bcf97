pub mod executors;
pub mod resource;
pub mod service;

pub use executors::*;
pub use resource::*;
pub use service::*;
