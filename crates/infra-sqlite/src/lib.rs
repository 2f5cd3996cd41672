// cmdexec Infrastructure - SQLite Adapter
// Implements: ExecutionStore (optional durable store)

mod connection;
mod execution_store;
mod migration;

pub use connection::{create_file_pool, create_pool};
pub use execution_store::SqliteExecutionStore;
pub use migration::run_migrations;

// sqlx::Error -> AppError conversion lives in execution_store::map_sqlx_error
// (orphan rules: From<sqlx::Error> for AppError cannot be implemented here)
