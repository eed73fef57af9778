//! Progress bus: single-producer-multiple-consumer fan-out of structured
//! progress events (§4.3). Built on `tokio::sync::broadcast`, whose bounded
//! ring buffer gives the "a slow subscriber may drop events, oldest-drop
//! policy, never blocks the producer" semantics the spec calls for
//! directly: a lagging receiver observes `RecvError::Lagged` and
//! resynchronizes rather than stalling the sender.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::item::ItemId;
use crate::trace::TraceEvent;

/// Default channel capacity; chosen generously since the aggregator and the
/// verbose reporter are both fast, non-blocking subscribers.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEvent {
    IterationStarted {
        item_id: ItemId,
        item_title: String,
        worktree: String,
    },
    IterationEnded {
        item_id: ItemId,
        outcome: String,
        duration_ms: u64,
    },
    ToolStarted {
        item_id: ItemId,
        trace_event: TraceEvent,
    },
    ToolEnded {
        item_id: ItemId,
        trace_event: TraceEvent,
    },
    LogLine {
        item_id: ItemId,
        line: String,
    },
    StatusChange {
        message: String,
    },
}

/// A subscriber handle. Wraps `broadcast::Receiver` so callers don't need
/// to depend on `tokio::sync::broadcast` directly.
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Receive the next event, or `None` once every publisher handle has
    /// been dropped and the channel is permanently closed. A `Lagged`
    /// error (subscriber fell behind and events were dropped) is
    /// transparently skipped past rather than surfaced as an error,
    /// matching the "best-effort per-subscriber" delivery contract.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The progress bus itself. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new subscriber. Subscribers only see events published
    /// after this call.
    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription { rx: self.tx.subscribe() }
    }

    /// Publish an event. Never blocks: `broadcast::Sender::send` returns
    /// immediately even with zero or lagging receivers.
    pub fn publish(&self, event: ProgressEvent) {
        // An error here just means there are currently no subscribers;
        // that is not a producer-visible failure.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
