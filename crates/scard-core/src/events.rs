//! Event system for card notifications.
//!
//! Backends report card transitions through an [`EventSink`] without
//! knowing who listens (daemon event manager, CLI, tests).

use std::fmt;
use std::sync::mpsc::Sender;

use thiserror::Error;
use tracing::debug;

/// Card slot transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    Inserted,
    Removed,
}

impl fmt::Display for CardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardEvent::Inserted => write!(f, "inserted"),
            CardEvent::Removed => write!(f, "removed"),
        }
    }
}

/// Events emitted by this subsystem, tagged by source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Smartcard(CardEvent),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side has gone away.
    #[error("Event sink gone")]
    Gone,
    #[error("Event rejected: {0}")]
    Rejected(String),
}

/// Receiver of events.
///
/// Implement this trait in the consuming layer to receive updates.
pub trait EventSink: Send + Sync {
    fn report(&self, event: &Event) -> Result<(), SinkError>;
}

/// Report `event`, swallowing delivery failures.
pub fn deliver(sink: &dyn EventSink, event: Event) {
    match sink.report(&event) {
        Ok(()) | Err(SinkError::Gone) => {}
        Err(e) => debug!(error = %e, ?event, "Event delivery failed"),
    }
}

/// No-op sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn report(&self, _event: &Event) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that logs events using tracing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn report(&self, event: &Event) -> Result<(), SinkError> {
        match event {
            Event::Smartcard(state) => tracing::info!(state = %state, "Smartcard event"),
        }
        Ok(())
    }
}

/// Sink forwarding events into a channel.
pub struct ChannelSink {
    tx: parking_lot::Mutex<Sender<Event>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self {
            tx: parking_lot::Mutex::new(tx),
        }
    }
}

impl EventSink for ChannelSink {
    fn report(&self, event: &Event) -> Result<(), SinkError> {
        self.tx.lock().send(*event).map_err(|_| SinkError::Gone)
    }
}
