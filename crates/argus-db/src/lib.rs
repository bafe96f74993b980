pub mod config;
pub mod database;
pub mod result_repository;
pub mod task_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use result_repository::ResultRepository;
pub use task_repository::TaskRepository;
