pub mod app_config;
pub mod pool;
pub mod postgres;
pub mod memory;

pub use pool::{PoolSettings, SessionLimiter};
pub use postgres::PgStore;
pub use memory::MemoryStore;
