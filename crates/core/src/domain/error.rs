// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid execution state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Output sequence out of order: {seq} after {last}")]
    SequenceOutOfOrder { last: u64, seq: u64 },

    #[error("Output rejected in state {0}")]
    OutputNotAccepted(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
