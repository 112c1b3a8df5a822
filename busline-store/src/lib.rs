pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod http;
pub mod queue_repo;
pub mod redis_repo;
pub mod retry;

pub use app_config::Config;
pub use booking_repo::PgBookingRepository;
pub use database::DbClient;
pub use events::{EventProducer, KafkaNotifier};
pub use http::{HttpPaymentGateway, HttpTripCatalog, HttpUserDirectory};
pub use queue_repo::PgDelayedQueue;
pub use redis_repo::RedisSeatLockStore;
