pub mod config;
pub mod database;
pub mod score_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use score_repository::ScoreRepository;
