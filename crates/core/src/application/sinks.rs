// In-process event sinks
// BroadcastEventSink feeds live subscriptions; FanoutEventSink combines sinks

use crate::domain::ExecutionEvent;
use crate::port::{EventSink, SinkError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Default capacity of the broadcast ring (slow subscribers lag, never block)
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Publishes every event on a `tokio::sync::broadcast` channel
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn deliver(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        // no subscribers is not a failure
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Delivers each event to every inner sink; one failing sink never starves the others
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn deliver(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        let mut last_error = None;
        let mut delivered = 0usize;
        for sink in &self.sinks {
            match sink.deliver(event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(execution_id = %event.execution_id(), error = %e, "Fan-out sink failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutputChunk, StreamKind};
    use crate::port::event_sink::mocks::RecordingSink;

    fn event() -> ExecutionEvent {
        ExecutionEvent::output("e1", &OutputChunk::new(0, StreamKind::Stdout, "x", 0))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        sink.deliver(&event()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastEventSink::default();
        assert_eq!(sink.subscriber_count(), 0);
        assert!(sink.deliver(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fanout_isolates_failures() {
        let broken = Arc::new(RecordingSink::new());
        broken.set_failing(true);
        let healthy = Arc::new(RecordingSink::new());
        let fanout = FanoutEventSink::new(vec![broken.clone(), healthy.clone()]);

        assert!(fanout.deliver(&event()).await.is_ok());
        assert_eq!(healthy.events().len(), 1);

        healthy.set_failing(true);
        assert!(fanout.deliver(&event()).await.is_err());
    }
}
