//! In-process event distribution for logger subscribers

use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

/// Type of logger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    /// A rendered device line
    Line,
    /// A session was established
    Connected,
    /// The link was lost
    Disconnected,
    /// Waiting before the next reconnect attempt
    Reconnecting,
    /// A failure was reported
    Error,
}

/// Event published by the logger controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LoggerEvent {
    /// A rendered line as written to stdout and the log file
    Line(String),
    /// Connected to a device
    Connected {
        /// Device address
        address: String,
        /// Advertised name, empty when none
        name: String,
    },
    /// The link to a device was lost
    Disconnected {
        /// Device address
        address: String,
    },
    /// A reconnect attempt is scheduled
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// An error occurred
    Error(String),
}

impl LoggerEvent {
    /// Get the type of this event
    pub fn get_type(&self) -> EventType {
        match self {
            Self::Line(_) => EventType::Line,
            Self::Connected { .. } => EventType::Connected,
            Self::Disconnected { .. } => EventType::Disconnected,
            Self::Reconnecting { .. } => EventType::Reconnecting,
            Self::Error(_) => EventType::Error,
        }
    }

    /// Get the device address from this event, if available
    pub fn get_device_address(&self) -> Option<&str> {
        match self {
            Self::Connected { address, .. } | Self::Disconnected { address } => Some(address),
            _ => None,
        }
    }
}

/// Defines which events a subscriber is interested in
pub enum EventFilter {
    /// Accept all events
    All,
    /// Only specific event types
    EventTypes(Vec<EventType>),
    /// Only connection events for specific device addresses
    Devices(Vec<String>),
    /// Custom filter function
    Custom(Box<dyn Fn(&LoggerEvent) -> bool + Send + Sync + 'static>),
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "EventFilter::All"),
            Self::EventTypes(types) => write!(f, "EventFilter::EventTypes({:?})", types),
            Self::Devices(addresses) => write!(f, "EventFilter::Devices({:?})", addresses),
            Self::Custom(_) => write!(f, "EventFilter::Custom(<function>)"),
        }
    }
}

impl EventFilter {
    /// Accept everything
    pub fn all() -> Self {
        Self::All
    }

    /// Create a filter for specific event types
    pub fn event_types(types: Vec<EventType>) -> Self {
        Self::EventTypes(types)
    }

    /// Only device lines
    pub fn lines_only() -> Self {
        Self::event_types(vec![EventType::Line])
    }

    /// Create a custom filter with a closure
    pub fn custom<F>(filter_fn: F) -> Self
    where
        F: Fn(&LoggerEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Box::new(filter_fn))
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &LoggerEvent) -> bool {
        match self {
            Self::All => true,
            Self::EventTypes(types) => types.contains(&event.get_type()),
            Self::Devices(addresses) => event
                .get_device_address()
                .map(|address| addresses.iter().any(|a| a.eq_ignore_ascii_case(address)))
                .unwrap_or(false),
            Self::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Subscriber ID type
pub type SubscriberId = u32;

struct Subscriber {
    id: SubscriberId,
    sender: Sender<LoggerEvent>,
    filter: EventFilter,
}

/// Distributes logger events to subscribers
pub struct EventBroker {
    next_subscriber_id: SubscriberId,
    subscribers: Vec<Subscriber>,
    capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    /// Create a new event broker
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    /// Create a broker whose subscriber channels hold `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_subscriber_id: 1,
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to events with a filter
    pub fn subscribe(&mut self, filter: EventFilter) -> (SubscriberId, Receiver<LoggerEvent>) {
        let (tx, rx) = channel(self.capacity);
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;

        self.subscribers.push(Subscriber {
            id,
            sender: tx,
            filter,
        });

        (id, rx)
    }

    /// Unsubscribe from events
    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// Never waits: a full subscriber misses the event, a closed one is
    /// removed.
    pub fn publish(&mut self, event: &LoggerEvent) {
        self.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(event) {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::debug!("Subscriber {} is lagging; event dropped", subscriber.id);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Subscriber {} went away", subscriber.id);
                    false
                }
            }
        });
    }

    /// Drop all subscribers, closing their channels
    pub fn shutdown(&mut self) {
        self.subscribers.clear();
    }
}

/// A helper to create a Stream from an event receiver
pub fn receiver_to_stream(mut rx: Receiver<LoggerEvent>) -> impl Stream<Item = LoggerEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}
