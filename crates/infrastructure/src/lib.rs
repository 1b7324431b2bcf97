pub mod memory;
pub mod redis_store;

pub use memory::*;
pub use redis_store::*;
