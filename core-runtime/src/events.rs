//! # Event Bus System
//!
//! Lifecycle notifications for the offline sync engine, delivered over
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus carries coarse, discrete facts ("course 42 was enqueued",
//! "periodic run skipped on cellular"). Fine-grained progress does *not* flow
//! through here; the progress aggregator publishes its own view stream. Hosts
//! use events for toasts, notifications and diagnostics.
//!
//! ```text
//! ┌───────────┐    emit     ┌───────────┐   subscribe   ┌────────────┐
//! │ Scheduler ├────────────>│           ├──────────────>│ Subscriber │
//! └───────────┘             │ EventBus  │               └────────────┘
//! ┌───────────┐    emit     │ (broadcast│   subscribe   ┌────────────┐
//! │Aggregator ├────────────>│  channel) ├──────────────>│ Subscriber │
//! └───────────┘             └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::Cancelled {
//!     course_id: "42".to_string(),
//! }))
//! .ok();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.description(), "Course sync cancelled");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber fell behind and missed `n`
//!   events. Keep receiving; later events are still delivered.
//! - **`RecvError::Closed`**: every sender was dropped.
//! - `emit` returns `Err` when nobody is subscribed. Publishers ignore it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-course job lifecycle
    Sync(SyncEvent),
    /// Scheduler decisions and policy changes
    Schedule(ScheduleEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Schedule(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::EnqueueAborted { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Finished { state, .. }) if state.as_str() != "completed" => {
                EventSeverity::Warning
            }
            CoreEvent::Sync(SyncEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Schedule(ScheduleEvent::PeriodicSkipped { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Per-course job lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A course sync job was handed to the work dispatcher and registered.
    Enqueued {
        course_id: String,
        /// Opaque dispatcher handle.
        handle: String,
    },
    /// A course was left out of a sync request.
    Skipped {
        course_id: String,
        /// Why, e.g. "already active".
        reason: String,
    },
    /// The aggregator observed a terminal state for a course.
    Finished {
        course_id: String,
        /// "completed", "partially_failed" or "failed".
        state: String,
    },
    /// The course's job was cancelled.
    Cancelled { course_id: String },
    /// The job could not be registered and was withdrawn before it started.
    EnqueueAborted { course_id: String, message: String },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Enqueued { .. } => "Course sync enqueued",
            SyncEvent::Skipped { .. } => "Course sync skipped",
            SyncEvent::Finished { .. } => "Course sync finished",
            SyncEvent::Cancelled { .. } => "Course sync cancelled",
            SyncEvent::EnqueueAborted { .. } => "Course sync enqueue aborted",
        }
    }
}

// ============================================================================
// Schedule Events
// ============================================================================

/// Scheduler decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ScheduleEvent {
    /// A periodic run enqueued work for these courses.
    PeriodicRun { courses: Vec<String> },
    /// A periodic run was evaluated and did nothing.
    PeriodicSkipped { reason: String },
    /// Sync policy was changed through the engine.
    PolicyChanged {
        auto_sync_enabled: bool,
        wifi_only: bool,
        frequency: String,
    },
}

impl ScheduleEvent {
    fn description(&self) -> &str {
        match self {
            ScheduleEvent::PeriodicRun { .. } => "Periodic sync started",
            ScheduleEvent::PeriodicSkipped { .. } => "Periodic sync skipped",
            ScheduleEvent::PolicyChanged { .. } => "Sync policy changed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
///
/// Cloning the bus clones the sender; all clones publish to the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus that buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional predicate.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(16);
/// let schedule_only = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Schedule(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned from `recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next matching event.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive. `None` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
