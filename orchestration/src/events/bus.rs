//! Event broadcaster for pipeline notifications
//!
//! Provides pub/sub messaging using a bounded Tokio broadcast channel.
//! Publishing never blocks: a subscriber that falls behind loses the
//! oldest events and is told how many it missed.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::PipelineEvent;

/// Default channel capacity for broadcast
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBroadcaster
pub type SharedEventBroadcaster = Arc<EventBroadcaster>;

/// Event broadcaster over a bounded, drop-oldest channel
#[derive(Debug)]
pub struct EventBroadcaster {
    /// Broadcast sender for publishing events
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBroadcaster {
    /// Create a broadcaster with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broadcaster holding at most `capacity` undelivered events
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Create a shared reference to this broadcaster
    pub fn shared(self) -> SharedEventBroadcaster {
        Arc::new(self)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that will see it; zero is not an
    /// error.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by ticket ID
    pub ticket_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by ticket ID. Events without a ticket are dropped.
    pub fn ticket(mut self, ticket_id: &str) -> Self {
        self.ticket_id = Some(ticket_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &PipelineEvent) -> bool {
        if let Some(ref tid) = self.ticket_id {
            if event.ticket_id() != Some(tid.as_str()) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Receiver that yields matching events and skips over lag
pub struct EventSubscriber {
    receiver: broadcast::Receiver<PipelineEvent>,
    filter: EventFilter,
    missed: u64,
}

impl EventSubscriber {
    pub fn new(receiver: broadcast::Receiver<PipelineEvent>, filter: EventFilter) -> Self {
        Self {
            receiver,
            filter,
            missed: 0,
        }
    }

    /// Receive the next matching event.
    ///
    /// Lag is logged and skipped; only a closed channel is an error.
    pub async fn recv(&mut self) -> EventBusResult<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                    warn!(missed = n, total_missed = self.missed, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed)
                }
            }
        }
    }

    /// Events dropped so far because this subscriber fell behind
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscriber;
}

impl EventBusExt for EventBroadcaster {
    fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscriber {
        EventSubscriber::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBroadcaster {
    fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscriber {
        EventSubscriber::new(self.subscribe(), filter)
    }
}
