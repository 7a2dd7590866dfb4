pub mod app_config;
pub mod database;
pub mod events;
pub mod memory;
pub mod order_repo;
pub mod subscription_repo;
pub mod catalog_repo;
pub mod log_repo;

pub use database::DbClient;
pub use events::LogPublisher;
#[cfg(feature = "kafka")]
pub use events::EventProducer;
pub use memory::{
    InMemoryChannelRepository, InMemoryOrderRepository, InMemoryPaymentLogRepository, InMemoryProductRepository,
    InMemorySubscriptionRepository,
};
pub use order_repo::PgOrderRepository;
pub use subscription_repo::PgSubscriptionRepository;
pub use catalog_repo::{PgChannelRepository, PgProductRepository};
pub use log_repo::PgPaymentLogRepository;
