//! Output streamer
//!
//! Decouples supervisors from the event sink. Each execution gets a lane:
//! a bounded chunk queue drained by one delivery task, so per-execution
//! order is preserved and a slow sink never blocks the process pump.
//! On overflow the oldest queued chunk is dropped; status events are never
//! dropped. A `truncated` notice precedes the next delivered event after a
//! drop. Delivery is at most once.

use crate::domain::{ExecutionEvent, ExecutionId};
use crate::port::{EventSink, TimeProvider};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Default)]
struct LaneState {
    queue: VecDeque<ExecutionEvent>,
    queued_chunks: usize,
    dropped: u64,
    terminal_seen: bool,
    closed: bool,
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

type Lanes = Arc<Mutex<HashMap<ExecutionId, Arc<Lane>>>>;

pub struct OutputStreamer {
    sink: Arc<dyn EventSink>,
    time_provider: Arc<dyn TimeProvider>,
    queue_depth: usize,
    lanes: Lanes,
}

impl OutputStreamer {
    /// # Arguments
    /// * `sink` - Delivery target
    /// * `time_provider` - Clock for synthetic `truncated` notices
    /// * `queue_depth` - Max queued output chunks per execution (at least 1)
    pub fn new(
        sink: Arc<dyn EventSink>,
        time_provider: Arc<dyn TimeProvider>,
        queue_depth: usize,
    ) -> Self {
        Self {
            sink,
            time_provider,
            queue_depth: queue_depth.max(1),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue an event for delivery; never waits on the sink
    pub fn publish(&self, event: ExecutionEvent) {
        loop {
            let lane = self.lane_for(event.execution_id());
            let Ok(mut state) = lane.state.lock() else {
                warn!(execution_id = %event.execution_id(), "Streamer lane poisoned, event dropped");
                return;
            };
            if state.closed {
                // lane retired between lookup and lock; the next lookup creates a fresh one
                continue;
            }

            if event.is_output() {
                if state.queued_chunks >= self.queue_depth {
                    if let Some(pos) = state.queue.iter().position(|e| e.is_output()) {
                        state.queue.remove(pos);
                        state.queued_chunks -= 1;
                        state.dropped += 1;
                    }
                }
                state.queued_chunks += 1;
            }
            state.queue.push_back(event);
            drop(state);
            lane.notify.notify_one();
            return;
        }
    }

    /// Number of executions with undelivered events
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Wait until every lane has delivered its terminal event
    ///
    /// Returns false if lanes are still active after `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_lanes() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn lane_for(&self, execution_id: &str) -> Arc<Lane> {
        let mut lanes = match self.lanes.lock() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(lane) = lanes.get(execution_id) {
            return lane.clone();
        }

        let lane = Arc::new(Lane::default());
        lanes.insert(execution_id.to_string(), lane.clone());
        tokio::spawn(deliver_lane(
            execution_id.to_string(),
            lane.clone(),
            self.lanes.clone(),
            self.sink.clone(),
            self.time_provider.clone(),
        ));
        lane
    }
}

enum Next {
    Deliver(Option<ExecutionEvent>, ExecutionEvent),
    Wait,
    Retire,
}

async fn deliver_lane(
    execution_id: ExecutionId,
    lane: Arc<Lane>,
    lanes: Lanes,
    sink: Arc<dyn EventSink>,
    time_provider: Arc<dyn TimeProvider>,
) {
    debug!(execution_id = %execution_id, "Streamer lane opened");
    loop {
        let next = match lane.state.lock() {
            Ok(mut state) => match state.queue.pop_front() {
                Some(event) => {
                    if event.is_output() {
                        state.queued_chunks -= 1;
                    }
                    if event.is_terminal() {
                        state.terminal_seen = true;
                    }
                    let notice = (state.dropped > 0).then(|| {
                        let dropped = std::mem::take(&mut state.dropped);
                        ExecutionEvent::truncated(
                            execution_id.clone(),
                            dropped,
                            time_provider.now_millis(),
                        )
                    });
                    Next::Deliver(notice, event)
                }
                None if state.terminal_seen => Next::Retire,
                None => Next::Wait,
            },
            Err(_) => Next::Retire,
        };

        match next {
            Next::Deliver(notice, event) => {
                if let Some(notice) = notice {
                    send(&*sink, &notice).await;
                }
                send(&*sink, &event).await;
            }
            Next::Wait => lane.notify.notified().await,
            Next::Retire => {
                let mut map = match lanes.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Ok(mut state) = lane.state.lock() {
                    if !state.queue.is_empty() {
                        continue;
                    }
                    state.closed = true;
                }
                if map
                    .get(&execution_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &lane))
                {
                    map.remove(&execution_id);
                }
                debug!(execution_id = %execution_id, "Streamer lane retired");
                return;
            }
        }
    }
}

async fn send(sink: &dyn EventSink, event: &ExecutionEvent) {
    if let Err(e) = sink.deliver(event).await {
        warn!(
            execution_id = %event.execution_id(),
            error = %e,
            "Event delivery failed, event dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionRecord, ExecutionStatus, OutputChunk, StreamKind};
    use crate::port::event_sink::mocks::RecordingSink;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    fn chunk_event(id: &str, seq: u64) -> ExecutionEvent {
        let chunk = OutputChunk::new(seq, StreamKind::Stdout, format!("line {}\n", seq), 0);
        ExecutionEvent::output(id, &chunk)
    }

    fn status_event(id: &str, status: ExecutionStatus) -> ExecutionEvent {
        let mut record = ExecutionRecord::new(id, "echo", "alice", 0);
        if status != ExecutionStatus::Scheduled {
            record.start(1, None).unwrap();
        }
        if status == ExecutionStatus::Completed {
            record.finish(0, 2).unwrap();
        }
        ExecutionEvent::status_of(&record, 2)
    }

    fn streamer(sink: Arc<RecordingSink>, depth: usize) -> OutputStreamer {
        OutputStreamer::new(sink, Arc::new(ManualTimeProvider::new(0)), depth)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sink = Arc::new(RecordingSink::new());
        let streamer = streamer(sink.clone(), 16);

        streamer.publish(status_event("e1", ExecutionStatus::Running));
        for seq in 0..5 {
            streamer.publish(chunk_event("e1", seq));
        }
        streamer.publish(status_event("e1", ExecutionStatus::Completed));

        assert!(streamer.flush(Duration::from_secs(2)).await);
        let events = sink.events_for("e1");
        assert_eq!(events.len(), 7);
        assert!(matches!(
            events[0],
            ExecutionEvent::Status { status: ExecutionStatus::Running, .. }
        ));
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Output { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(events[6].is_terminal());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_chunks_keeps_status() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_millis(50)));
        let streamer = streamer(sink.clone(), 2);

        streamer.publish(status_event("e1", ExecutionStatus::Running));
        for seq in 0..10 {
            streamer.publish(chunk_event("e1", seq));
        }
        streamer.publish(status_event("e1", ExecutionStatus::Completed));

        assert!(streamer.flush(Duration::from_secs(5)).await);
        let events = sink.events_for("e1");

        // newest chunks survive
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Output { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![8, 9]);

        let dropped: u64 = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Truncated { dropped_chunks, .. } => Some(*dropped_chunks),
                _ => None,
            })
            .sum();
        assert_eq!(dropped, 8);

        let statuses = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Status { .. }))
            .count();
        assert_eq!(statuses, 2);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_lane() {
        let sink = Arc::new(RecordingSink::new());
        sink.set_failing(true);
        let streamer = streamer(sink.clone(), 4);

        streamer.publish(chunk_event("e1", 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.set_failing(false);
        streamer.publish(chunk_event("e1", 1));
        streamer.publish(status_event("e1", ExecutionStatus::Completed));

        assert!(streamer.flush(Duration::from_secs(2)).await);
        let events = sink.events_for("e1");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ExecutionEvent::Output { seq: 1, .. }));
    }

    #[tokio::test]
    async fn test_lanes_are_independent_and_retire() {
        let sink = Arc::new(RecordingSink::new());
        let streamer = streamer(sink.clone(), 4);

        streamer.publish(chunk_event("a", 0));
        streamer.publish(chunk_event("b", 0));
        assert_eq!(streamer.active_lanes(), 2);

        streamer.publish(status_event("a", ExecutionStatus::Completed));
        streamer.publish(status_event("b", ExecutionStatus::Completed));

        assert!(streamer.flush(Duration::from_secs(2)).await);
        assert_eq!(sink.events_for("a").len(), 2);
        assert_eq!(sink.events_for("b").len(), 2);
    }
}
