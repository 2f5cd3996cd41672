// Event Sink Port
// Delivery target for lifecycle events (socket service, RPC subscribers, ...)

use crate::domain::ExecutionEvent;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Sink could not be reached (connection refused, timeout)
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// Sink answered but refused the event
    #[error("Sink rejected event: {0}")]
    Rejected(String),
}

/// Event Sink trait
///
/// Delivery is at most once: the streamer logs a failed delivery and moves on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &ExecutionEvent) -> Result<(), SinkError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every delivered event; optionally slow or failing
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<ExecutionEvent>>,
        delay: Option<Duration>,
        failing: AtomicBool,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every delivery sleeps first (backpressure tests)
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn events(&self) -> Vec<ExecutionEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn events_for(&self, execution_id: &str) -> Vec<ExecutionEvent> {
            self.events()
                .into_iter()
                .filter(|e| e.execution_id() == execution_id)
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Unavailable("mock sink offline".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}
