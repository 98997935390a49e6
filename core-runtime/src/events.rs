//! # Event Bus System
//!
//! Broadcasts federation progress using `tokio::sync::broadcast` so hosts can
//! observe sync runs, broadcasts and aggregation without polling.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: `FederationEvent` wrapping per-domain enums
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ```text
//! ┌──────────────────┐   emit    ┌───────────┐  subscribe  ┌────────────┐
//! │ DirectorySync    ├──────────>│           ├────────────>│ Host UI    │
//! └──────────────────┘           │ EventBus  │             └────────────┘
//! ┌──────────────────┐   emit    │ (broadcast│  subscribe  ┌────────────┐
//! │ Aggregator       ├──────────>│  channel) ├────────────>│ Audit log  │
//! └──────────────────┘           └───────────┘             └────────────┘
//! ```
//!
//! Emission is fire-and-forget: publishing with no subscribers is not an
//! error for the engine, which ignores the `SendError`.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, EventStream, FederationEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut failures = EventStream::new(event_bus.subscribe())
//!     .filter(|event| event.severity() >= core_runtime::events::EventSeverity::Warning);
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = failures.recv().await {
//!         eprintln!("{}: {:?}", event.description(), event);
//!     }
//! });
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Federation Event Types
// ============================================================================

/// Top-level event published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum FederationEvent {
    /// Directory synchronization
    Sync(SyncEvent),
    /// Outbound presence announcements
    Broadcast(BroadcastEvent),
    /// Publication aggregation across peers
    Aggregation(AggregationEvent),
}

impl FederationEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            FederationEvent::Sync(e) => e.description(),
            FederationEvent::Broadcast(e) => e.description(),
            FederationEvent::Aggregation(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            FederationEvent::Sync(SyncEvent::DirectoryFailed { .. }) => EventSeverity::Error,
            FederationEvent::Broadcast(BroadcastEvent::Failed { .. }) => EventSeverity::Warning,
            FederationEvent::Aggregation(AggregationEvent::EndpointFailed { .. }) => {
                EventSeverity::Warning
            }
            FederationEvent::Sync(SyncEvent::Completed { .. })
            | FederationEvent::Sync(SyncEvent::DirectorySynced { .. })
            | FederationEvent::Aggregation(AggregationEvent::Completed { .. }) => {
                EventSeverity::Info
            }
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

/// Events emitted while synchronizing listings from peer directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A run over one or more directories started.
    Started {
        /// Directories scheduled in this run.
        directories: Vec<String>,
    },
    /// One directory was fetched and reconciled.
    DirectorySynced {
        directory: String,
        created: u64,
        updated: u64,
        unchanged: u64,
        skipped: u64,
        failed: u64,
    },
    /// Fetching or validating a directory failed.
    DirectoryFailed {
        directory: String,
        /// HTTP status when the peer answered at all.
        status: Option<u16>,
        message: String,
    },
    /// The run finished (successfully or not) for every directory.
    Completed {
        directories: u64,
        total_processed: u64,
        duration_ms: u64,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Directory sync started",
            SyncEvent::DirectorySynced { .. } => "Directory synchronized",
            SyncEvent::DirectoryFailed { .. } => "Directory sync failed",
            SyncEvent::Completed { .. } => "Directory sync completed",
        }
    }
}

// ============================================================================
// Broadcast Events
// ============================================================================

/// Events emitted while announcing this instance to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum BroadcastEvent {
    Delivered {
        target: String,
        attempts: u32,
    },
    /// Every attempt failed; the target is recorded as unreachable.
    Failed {
        target: String,
        attempts: u32,
        message: String,
    },
}

impl BroadcastEvent {
    fn description(&self) -> &str {
        match self {
            BroadcastEvent::Delivered { .. } => "Broadcast delivered",
            BroadcastEvent::Failed { .. } => "Broadcast failed",
        }
    }
}

// ============================================================================
// Aggregation Events
// ============================================================================

/// Events emitted while aggregating publications from peer endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AggregationEvent {
    EndpointFailed {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
    Completed {
        endpoints: u64,
        successful_calls: u64,
        failed_calls: u64,
        total_publications: u64,
        duration_ms: u64,
    },
}

impl AggregationEvent {
    fn description(&self) -> &str {
        match self {
            AggregationEvent::EndpointFailed { .. } => "Publication endpoint failed",
            AggregationEvent::Completed { .. } => "Publication aggregation completed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to federation events.
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FederationEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: FederationEvent) -> Result<usize, SendError<FederationEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<FederationEvent> {
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

type EventFilter = Box<dyn Fn(&FederationEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with predicate filtering.
pub struct EventStream {
    receiver: Receiver<FederationEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<FederationEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FederationEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &FederationEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<FederationEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<FederationEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
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
