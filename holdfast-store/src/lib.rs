pub mod app_config;
pub mod database;
#[cfg(feature = "kafka")]
pub mod events;
pub mod order_repo;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
#[cfg(feature = "kafka")]
pub use events::EventProducer;
pub use order_repo::PgOrderRepository;
pub use redis_repo::RedisKeyValueStore;
