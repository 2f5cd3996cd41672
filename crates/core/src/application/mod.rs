// Application Layer - Use Cases and Business Logic

pub mod manager;
pub mod memory_store;
pub mod policy;
pub mod recovery;
pub mod retention;
pub mod sinks;
pub mod streamer;

// Re-exports
pub use manager::{EngineHealth, ExecutionManager, ManagerSettings};
pub use memory_store::InMemoryExecutionStore;
pub use policy::PolicyValidator;
pub use recovery::RecoveryService;
pub use retention::RetentionSweeper;
pub use sinks::{BroadcastEventSink, FanoutEventSink};
pub use streamer::OutputStreamer;
