// Port Layer - Interfaces for external dependencies

pub mod cancel;
pub mod event_sink;
pub mod execution_store;
pub mod id_provider; // For deterministic testing
pub mod process_control;
pub mod process_runner;
pub mod time_provider;

// Re-exports
pub use cancel::{cancel_channel, CancelSender, CancelToken};
pub use event_sink::{EventSink, SinkError};
pub use execution_store::{ExecutionFilter, ExecutionStore};
pub use id_provider::IdProvider;
pub use process_control::ProcessControl;
pub use process_runner::{ExecutionError, ProcessOutcome, ProcessRunner, RunHandle, RunSpec};
pub use time_provider::TimeProvider;
