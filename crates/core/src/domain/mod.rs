// Domain Layer - Pure business logic and entities

pub mod error;
pub mod event;
pub mod execution;
pub mod policy;

// Re-exports
pub use error::DomainError;
pub use event::{rfc3339_from_millis, ExecutionEvent};
pub use execution::{
    CallerId, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionSummary, OutputChunk,
    StreamKind,
};
pub use policy::{Caller, Invocation, PermissionSet, PolicyConfig, PolicyDecision};
