//! Pipeline events.
//!
//! The orchestrator publishes typed [`PipelineEvent`]s on an [`EventBus`], a
//! thin wrapper over a tokio broadcast channel. Any number of subscribers may
//! listen; a subscriber that falls more than the channel capacity behind
//! receives `RecvError::Lagged` and skips ahead.
//!
//! # Example
//!
//! ```rust
//! use testwatch_monitor::events::{EventBus, PipelineEvent, UserNotifiedEvent};
//! use testwatch_monitor::types::FailureSignature;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! let signature = FailureSignature::from_raw("abc123");
//! bus.publish(PipelineEvent::UserNotified(UserNotifiedEvent { signature }));
//!
//! assert!(matches!(rx.try_recv(), Ok(PipelineEvent::UserNotified(_))));
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::trace;

use crate::types::{FailureSignature, TestRunResult};

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Emitted when a run is evaluated with a failing status.
#[derive(Debug, Clone)]
pub struct TestsFailedEvent {
    pub result: TestRunResult,
}

/// Emitted right after a notification was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotifiedEvent {
    pub signature: FailureSignature,
}

/// Events published by the watch pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    TestsFailed(TestsFailedEvent),
    UserNotified(UserNotifiedEvent),
}

impl PipelineEvent {
    /// Short name for log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestsFailed(_) => "tests_failed",
            Self::UserNotified(_) => "user_notified",
        }
    }
}

/// Distributes pipeline events to all subscribers.
///
/// Cheap to clone; clones publish on the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<PipelineEvent>,
}

impl EventBus {
    /// Creates a bus with [`DEFAULT_EVENT_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a bus holding up to `capacity` undelivered events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event`, returning how many subscribers received it.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(event = name, receivers, "Published pipeline event");
                receivers
            }
            Err(_) => {
                trace!(event = name, "No subscribers for pipeline event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
