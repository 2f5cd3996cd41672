// cmdexec Core - Domain Logic, Policy & Execution Supervision
// NO infrastructure dependencies: OS processes, databases and HTTP live in adapter crates

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use config::EngineConfig;
pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
