//! Chain events.
//!
//! Structural and status events are delivered synchronously to chain
//! listeners and mirrored to a broadcast channel so other threads (or async
//! tasks) can follow a chain without touching it. Frames are never mirrored.

use crate::unit::{StatusChange, UnitHandle, UnitStatus};
use std::fmt;
use tokio::sync::broadcast;

/// Events emitted by a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A unit was inserted.
    UnitAdded {
        /// The unit.
        unit: UnitHandle,
        /// Canonical id of the unit.
        id: String,
        /// Position it was inserted at.
        index: usize,
    },

    /// A unit was removed.
    UnitRemoved {
        /// The unit.
        unit: UnitHandle,
        /// Canonical id of the unit.
        id: String,
    },

    /// A unit was moved.
    UnitReordered {
        /// The unit.
        unit: UnitHandle,
        /// Previous position.
        from: usize,
        /// New position.
        to: usize,
    },

    /// A unit changed lifecycle status.
    UnitStatusChanged(StatusChange),
}

impl ChainEvent {
    /// Unit the event is about.
    pub fn unit(&self) -> UnitHandle {
        match self {
            ChainEvent::UnitAdded { unit, .. }
            | ChainEvent::UnitRemoved { unit, .. }
            | ChainEvent::UnitReordered { unit, .. } => *unit,
            ChainEvent::UnitStatusChanged(change) => change.unit,
        }
    }

    /// Returns true for a status change of `unit` from `from` to `to`.
    pub fn is_transition(&self, unit: UnitHandle, from: UnitStatus, to: UnitStatus) -> bool {
        matches!(self, ChainEvent::UnitStatusChanged(c) if c.unit == unit && c.from == from && c.to == to)
    }
}

impl fmt::Display for ChainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEvent::UnitAdded { unit, id, index } => {
                write!(f, "Unit {} ({}) added at {}", unit, id, index)
            }
            ChainEvent::UnitRemoved { unit, id } => write!(f, "Unit {} ({}) removed", unit, id),
            ChainEvent::UnitReordered { unit, from, to } => {
                write!(f, "Unit {} moved from {} to {}", unit, from, to)
            }
            ChainEvent::UnitStatusChanged(change) => {
                write!(f, "Unit {}: {} -> {}", change.unit, change.from, change.to)
            }
        }
    }
}

/// Synchronous chain event callback.
pub type ChainListener = dyn FnMut(&ChainEvent) + Send;

/// Sender side of the broadcast mirror, held by the chain.
#[derive(Clone)]
pub struct ChainEventSender {
    sender: broadcast::Sender<ChainEvent>,
}

impl ChainEventSender {
    /// Create a new event sender with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event.
    ///
    /// Returns the number of receivers that received the event (0 if
    /// nobody is subscribed).
    pub fn send(&self, event: ChainEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Create a receiver for events.
    pub fn subscribe(&self) -> ChainEventReceiver {
        ChainEventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChainEventSender {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for ChainEventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEventSender")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiver for chain events.
pub struct ChainEventReceiver {
    receiver: broadcast::Receiver<ChainEvent>,
}

impl ChainEventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the chain has been dropped. Events lost to lag
    /// are skipped.
    pub async fn recv(&mut self) -> Option<ChainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<ChainEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Blocking receive for threads outside a runtime.
    pub fn blocking_recv(&mut self) -> Option<ChainEvent> {
        loop {
            match self.receiver.blocking_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
