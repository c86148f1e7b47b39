//! Station notification bus.
//!
//! An explicitly constructed publish/subscribe channel used to broadcast command,
//! device, session and acquisition events outward. It is injected into the
//! components that publish, and torn down with [`EventBus::shutdown`].
//!
//! # Delivery
//!
//! ```text
//! Dispatcher / Registry / Session / Pipelines --publish--> broadcast::channel
//!                                                          ├─> BusSubscription (UI)
//!                                                          ├─> BusSubscription (logger)
//!                                                          └─> ...
//! ```
//!
//! Each subscriber owns its own receiver. A slow subscriber only lags itself: once
//! it falls more than `capacity` events behind, its oldest events are dropped and
//! it resumes with the newest. Publishers never block. Dropping a
//! [`BusSubscription`] unsubscribes it immediately.

use crate::command::record::CommandRecord;
use crate::device::ConnectionStatus;
use crate::error::{StationError, StationResult};
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

/// Default number of buffered events per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Events broadcast by the station core.
#[derive(Clone, Debug)]
pub enum StationEvent {
    /// A command finished (Completed or Error); carries the final record.
    CommandStatusChanged(CommandRecord),
    /// A device changed connection status.
    DeviceStatusChanged {
        /// Device identifier.
        device_id: String,
        /// Previous status.
        old: ConnectionStatus,
        /// New status.
        new: ConnectionStatus,
        /// When the change was observed.
        timestamp: DateTime<Utc>,
    },
    /// A test session changed lifecycle state.
    SessionStateChanged {
        /// Session name (empty before the session is started).
        session: String,
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// An acquisition pipeline started or stopped collecting.
    AcquisitionStateChanged {
        /// Device the pipeline polls.
        device_id: String,
        /// Whether the pipeline is collecting now.
        collecting: bool,
        /// When the change happened.
        timestamp: DateTime<Utc>,
    },
    /// A poll read raised a fault and the pipeline stopped.
    AcquisitionFault {
        /// Device the pipeline polls.
        device_id: String,
        /// Fault text.
        message: String,
        /// When the fault was delivered.
        timestamp: DateTime<Utc>,
    },
}

impl StationEvent {
    /// Short event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StationEvent::CommandStatusChanged(_) => "command_status_changed",
            StationEvent::DeviceStatusChanged { .. } => "device_status_changed",
            StationEvent::SessionStateChanged { .. } => "session_state_changed",
            StationEvent::AcquisitionStateChanged { .. } => "acquisition_state_changed",
            StationEvent::AcquisitionFault { .. } => "acquisition_fault",
        }
    }
}

/// Injected notification bus.
pub struct EventBus {
    sender: RwLock<Option<broadcast::Sender<StationEvent>>>,
    capacity: usize,
    published: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("open", &self.is_open())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates an open bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Publishes an event to all current subscribers and returns how many
    /// received it. Publishing on a closed bus or with no subscribers is not an
    /// error.
    pub fn publish(&self, event: StationEvent) -> usize {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            debug!(event = event.kind(), "Bus closed, dropping event");
            return 0;
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        sender.send(event).unwrap_or(0)
    }

    /// Registers a new subscriber. Only events published after this call are
    /// delivered to it.
    pub fn subscribe(&self) -> StationResult<BusSubscription> {
        let guard = self.sender.read();
        let sender = guard
            .as_ref()
            .ok_or_else(|| StationError::Shutdown("event bus is closed".into()))?;
        Ok(BusSubscription {
            receiver: sender.subscribe(),
            dropped: 0,
        })
    }

    /// Closes the bus. Subscribers drain what is buffered and then observe the
    /// end of the stream; later `subscribe` calls fail.
    pub fn shutdown(&self) {
        if self.sender.write().take().is_some() {
            debug!("Event bus shut down");
        }
    }

    /// True until [`EventBus::shutdown`] is called.
    pub fn is_open(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Total events published since construction.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// A subscriber's handle on the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct BusSubscription {
    receiver: broadcast::Receiver<StationEvent>,
    dropped: u64,
}

impl BusSubscription {
    /// Waits for the next event. Returns `None` once the bus is shut down and
    /// the backlog is drained.
    pub async fn recv(&mut self) -> Option<StationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, "Bus subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<StationEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, "Bus subscriber lagged, oldest events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to lagging.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
