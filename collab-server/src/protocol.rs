//! Binary sync protocol (y-protocols compatible).
//!
//! Wire format: a leading lib0 variable-length unsigned tag, then a
//! tag-specific body encoded with the Yrs codec.
//! ```text
//! ┌─────────────┬──────────────────────────────────────────────┐
//! │ tag         │ body                                         │
//! ├─────────────┼──────────────────────────────────────────────┤
//! │ 0 sync      │ sub-tag 0 step-1 (state vector)              │
//! │             │ sub-tag 1 step-2 (missing update)            │
//! │             │ sub-tag 2 update                             │
//! │ 1 awareness │ encoded set of presence deltas               │
//! │ 3 query     │ awareness query (no body)                    │
//! └─────────────┴──────────────────────────────────────────────┘
//! ```
//! Any other tag is reported as [`ProtocolError::UnknownTag`].

use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::error::ProtocolError;

/// Sync message tag.
pub const MSG_SYNC: u64 = 0;
/// Awareness message tag.
pub const MSG_AWARENESS: u64 = 1;
/// Awareness query tag.
pub const MSG_QUERY_AWARENESS: u64 = 3;

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Peer asks what we have that it lacks.
    SyncStep1(StateVector),
    /// Peer answers our step-1 with what we lack.
    SyncStep2(Vec<u8>),
    /// Incremental change.
    Update(Vec<u8>),
    /// Presence delta.
    Awareness(AwarenessUpdate),
    /// Peer asks for the full presence state.
    AwarenessQuery,
}

impl Frame {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SyncStep1(_) => "sync-step-1",
            Frame::SyncStep2(_) => "sync-step-2",
            Frame::Update(_) => "update",
            Frame::Awareness(_) => "awareness",
            Frame::AwarenessQuery => "awareness-query",
        }
    }
}

/// Read the leading lib0 varuint tag.
pub fn read_tag(bytes: &[u8]) -> Result<u64, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().take(10).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::TruncatedTag)
}

/// Decode an inbound binary frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let tag = read_tag(bytes)?;
    if tag != MSG_SYNC && tag != MSG_AWARENESS && tag != MSG_QUERY_AWARENESS {
        return Err(ProtocolError::UnknownTag(tag));
    }

    let message = Message::decode_v1(bytes).map_err(|e| ProtocolError::Malformed {
        kind: if tag == MSG_SYNC { "sync" } else { "awareness" },
        reason: e.to_string(),
    })?;

    match message {
        Message::Sync(SyncMessage::SyncStep1(sv)) => Ok(Frame::SyncStep1(sv)),
        Message::Sync(SyncMessage::SyncStep2(update)) => Ok(Frame::SyncStep2(update)),
        Message::Sync(SyncMessage::Update(update)) => Ok(Frame::Update(update)),
        Message::Awareness(update) => Ok(Frame::Awareness(update)),
        Message::AwarenessQuery => Ok(Frame::AwarenessQuery),
        _ => Err(ProtocolError::UnknownTag(tag)),
    }
}

/// Encode a sync step-1 carrying our state vector.
pub fn encode_sync_step1(sv: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1()
}

/// Encode a sync step-2 carrying the update the peer is missing.
pub fn encode_sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

/// Encode an incremental update.
pub fn encode_update(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update.to_vec())).encode_v1()
}

/// Encode a presence update.
pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}
