//! Fan-out of encoded frames to every connection on a document.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, and
//! each connection gets an independent receiver that buffers up to
//! `capacity` frames. A receiver that falls further behind than that is
//! told it lagged and resynchronises from full state.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

/// An encoded frame on its way to the connections of one document.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that caused the frame; it does not receive it back.
    /// None = deliver to everyone.
    pub origin: Option<Uuid>,
    pub payload: Arc<Vec<u8>>,
}

impl Outbound {
    pub fn new(origin: Option<Uuid>, payload: Vec<u8>) -> Self {
        Self {
            origin,
            payload: Arc::new(payload),
        }
    }

    /// A frame delivered to every connection, sender included.
    pub fn to_all(payload: Vec<u8>) -> Self {
        Self::new(None, payload)
    }

    /// Whether `connection` should receive this frame.
    pub fn is_for(&self, connection: Uuid) -> bool {
        self.origin != Some(connection)
    }
}

/// Broadcast group for a single document.
#[derive(Clone)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
}

impl BroadcastGroup {
    /// Create a new group buffering up to `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe a connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Send a frame. Returns the number of receivers it reached.
    pub fn send(&self, frame: Outbound) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }
}
