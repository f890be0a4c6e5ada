//! Binary protocol spoken between providers and the synchronization endpoint.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! A connection is bound to one room by its URL:
//! `{server}/api/collaboration/room/{room id}`. The room id of a document is
//! `"{format}:{type}:{path}"`, percent-encoded in the URL.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessState;
use crate::identity::Identity;

/// Path prefix under which rooms are served.
pub const ROOM_PREFIX: &str = "/api/collaboration/room/";

/// Room shared by every participant for presence, independent of documents.
pub const GLOBAL_AWARENESS_ROOM: &str = "global:awareness";

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what we are missing
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence state of one participant (JSON payload)
    Awareness = 4,
    /// First frame of every connection
    Join = 5,
    /// Peer left the room
    Leave = 6,
    Ping = 7,
    Pong = 8,
    /// Application-level message relayed to every participant
    Custom = 9,
    /// The room cannot be opened (payload: UTF-8 reason)
    SyncError = 10,
    /// Another session is editing the same resource (payload: UTF-8 path)
    SessionConflict = 11,
}

/// Payload of a `Join` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub session_id: Uuid,
    pub identity: Identity,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(msg_type: MessageType, peer_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            clock: 0,
            payload,
        }
    }

    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep1, peer_id, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep2, peer_id, state_diff)
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            clock,
            payload: yrs_update,
        }
    }

    /// Create an awareness message carrying the full presence record.
    pub fn awareness(peer_id: Uuid, clock: u64, state: &AwarenessState) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(state)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Awareness,
            peer_id,
            clock,
            payload,
        })
    }

    pub fn join(peer_id: Uuid, request: &JoinRequest) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(request, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::with_payload(MessageType::Join, peer_id, payload))
    }

    pub fn leave(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Leave, peer_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, Vec::new())
    }

    pub fn custom(peer_id: Uuid, payload: Vec<u8>) -> Self {
        Self::with_payload(MessageType::Custom, peer_id, payload)
    }

    pub fn sync_error(reason: &str) -> Self {
        Self::with_payload(MessageType::SyncError, Uuid::nil(), reason.as_bytes().to_vec())
    }

    pub fn session_conflict(path: &str) -> Self {
        Self::with_payload(MessageType::SessionConflict, Uuid::nil(), path.as_bytes().to_vec())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (request, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(request)
    }

    /// Payload of `SyncError` / `SessionConflict` frames.
    pub fn text(&self) -> Result<String, ProtocolError> {
        match self.msg_type {
            MessageType::SyncError | MessageType::SessionConflict => {
                String::from_utf8(self.payload.clone())
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
            }
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }
}

/// Build the WebSocket URL of a room.
pub fn room_url(server_url: &str, room_id: &str) -> String {
    format!(
        "{}{}{}",
        server_url.trim_end_matches('/'),
        ROOM_PREFIX,
        urlencoding::encode(room_id)
    )
}

/// Extract the room id from a request path, if it addresses a room.
pub fn parse_room_path(path: &str) -> Option<String> {
    let encoded = path.strip_prefix(ROOM_PREFIX)?;
    if encoded.is_empty() {
        return None;
    }
    urlencoding::decode(encoded).ok().map(|room| room.into_owned())
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
