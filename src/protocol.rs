//! Binary relay protocol for cursor presence synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room      │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable  │ 8 bytes  │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Rooms are addressed by name: peers sharing a room name see each
//! other's awareness state. The `seq` field orders awareness updates
//! per sender; document sync messages carry opaque Yrs v1 payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, requesting a state diff
    SyncStep1 = 1,
    /// Yrs state diff / full-state update response
    SyncStep2 = 2,
    /// Incremental CRDT delta update
    Delta = 3,
    /// Cursor awareness update
    Awareness = 4,
    /// Peer joined a room
    PeerJoined = 5,
    /// Peer left a room
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Top-level relay message.
///
/// Serialized with bincode for minimal overhead. A cursor awareness
/// frame is ~70 bytes on the wire including the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Room name scoping which peers see this message.
    pub room: String,
    /// Per-sender sequence number for awareness ordering.
    pub seq: u64,
    /// Message payload (varies by msg_type).
    pub payload: Vec<u8>,
}

impl RelayMessage {
    /// Create a room join announcement.
    pub fn peer_joined(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::PeerJoined,
            peer_id,
            room: room.into(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a room leave notification.
    pub fn peer_left(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            room: room.into(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create an awareness update carrying an encoded cursor record.
    pub fn awareness(peer_id: Uuid, room: impl Into<String>, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            room: room.into(),
            seq,
            payload,
        }
    }

    /// Create a delta update message carrying a Yrs v1 update.
    pub fn delta(peer_id: Uuid, room: impl Into<String>, yrs_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            room: room.into(),
            seq: 0,
            payload: yrs_update,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            room: room.into(),
            seq: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            room: room.into(),
            seq: 0,
            payload: state_diff,
        }
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            room: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            room: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PresenceError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, PresenceError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PresenceError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Errors surfaced by the presence layer.
#[derive(Debug, Clone)]
pub enum PresenceError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
    EmptyServerList,
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::EmptyServerList => write!(f, "No relay servers configured"),
        }
    }
}

impl std::error::Error for PresenceError {}
