//! Binary envelope for room traffic.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ sender    │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+n │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type:
//! - `SyncStep1` yrs state vector, `SyncStep2` / `Update` yrs v1 update
//! - `Awareness` bincode [`AwarenessMessage`]
//! - `Mutation` JSON [`TrackOp`]
//! - `UploadRequest` / `UploadGrant` JSON, camelCase
//! - `Error` JSON [`ErrorPayload`]
//! - `Ping` / `Pong` empty

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use stemroom_core::{ErrorKind, TrackError, TrackOp, UploadCredential, UploadRequest};

use crate::presence::AwarenessMessage;

/// Sender id used for messages that originate at the server.
pub const SERVER_SENDER: Uuid = Uuid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "send me what I am missing"
    SyncStep1 = 1,
    /// Diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    Awareness = 4,
    /// History operation executed by the room
    Mutation = 5,
    UploadRequest = 6,
    UploadGrant = 7,
    Error = 8,
    Ping = 9,
    Pong = 10,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::ConnectionClosed,
            other => ProtocolError::Transport(other.to_string()),
        }
    }
}

impl From<ProtocolError> for TrackError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Deserialization(_) | ProtocolError::InvalidMessageType(_) => {
                TrackError::InvalidRequest(e.to_string())
            }
            ProtocolError::Transport(_) | ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
                TrackError::UpstreamFailure(e.to_string())
            }
            ProtocolError::Serialization(_) => TrackError::Internal(e.to_string()),
        }
    }
}

/// Error reported to a peer. Carries the public text only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TrackError> for ErrorPayload {
    fn from(e: &TrackError) -> Self {
        Self {
            kind: e.kind(),
            message: e.public_message(),
        }
    }
}

impl ErrorPayload {
    pub fn into_error(self) -> TrackError {
        match self.kind {
            ErrorKind::Unauthorized => TrackError::Unauthorized(self.message),
            ErrorKind::InvalidRequest => TrackError::InvalidRequest(self.message),
            ErrorKind::NotFound => TrackError::NotFound(self.message),
            ErrorKind::UpstreamFailure => TrackError::UpstreamFailure(self.message),
            ErrorKind::Internal => TrackError::Internal(self.message),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection id of the originator, [`SERVER_SENDER`] for the server.
    pub sender: Uuid,
    /// Track id of the room.
    pub room: String,
    /// Per-room sequence for `Update`, per-client counter otherwise
    pub clock: u64,
    pub payload: Vec<u8>,
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

impl SyncMessage {
    fn new(msg_type: MessageType, sender: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sender,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn sync_step1(sender: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, sender, room, 0, state_vector)
    }

    pub fn sync_step2(sender: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, sender, room, 0, diff)
    }

    pub fn update(sender: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, sender, room, clock, update)
    }

    pub fn awareness(
        sender: Uuid,
        room: &str,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, sender, room, 0, message.encode()?))
    }

    pub fn mutation(sender: Uuid, room: &str, clock: u64, op: &TrackOp) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Mutation, sender, room, clock, to_json(op)?))
    }

    pub fn upload_request(
        sender: Uuid,
        room: &str,
        request: &UploadRequest,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::UploadRequest, sender, room, 0, to_json(request)?))
    }

    pub fn upload_grant(room: &str, credential: &UploadCredential) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::UploadGrant,
            SERVER_SENDER,
            room,
            0,
            to_json(credential)?,
        ))
    }

    pub fn error(room: &str, error: &TrackError) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Error,
            SERVER_SENDER,
            room,
            0,
            to_json(&ErrorPayload::from(error))?,
        ))
    }

    pub fn ping(sender: Uuid, room: &str) -> Self {
        Self::new(MessageType::Ping, sender, room, 0, Vec::new())
    }

    pub fn pong(room: &str) -> Self {
        Self::new(MessageType::Pong, SERVER_SENDER, room, 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(())
    }

    fn json_payload<T: serde::de::DeserializeOwned>(
        &self,
        msg_type: MessageType,
    ) -> Result<T, ProtocolError> {
        self.expect(msg_type)?;
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        AwarenessMessage::decode(&self.payload)
    }

    pub fn track_op(&self) -> Result<TrackOp, ProtocolError> {
        self.json_payload(MessageType::Mutation)
    }

    pub fn upload_request_payload(&self) -> Result<UploadRequest, ProtocolError> {
        self.json_payload(MessageType::UploadRequest)
    }

    pub fn upload_credential(&self) -> Result<UploadCredential, ProtocolError> {
        self.json_payload(MessageType::UploadGrant)
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, ProtocolError> {
        self.json_payload(MessageType::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemroom_core::Stem;

    #[test]
    fn test_update_roundtrip() {
        let sender = Uuid::new_v4();
        let msg = SyncMessage::update(sender, "track-42", 7, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_mutation_payload_is_json() {
        let op = TrackOp::AddStem {
            stem: Stem::new("Guitar", "https://cdn/x.wav"),
        };
        let msg = SyncMessage::mutation(Uuid::new_v4(), "track-42", 1, &op).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(json["op"], "addStem");
        assert_eq!(json["stem"]["name"], "Guitar");

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.track_op().unwrap(), op);
    }

    #[test]
    fn test_upload_request_wire_names() {
        let msg = SyncMessage::upload_request(
            Uuid::new_v4(),
            "t",
            &UploadRequest::new("a.wav", "audio/wav"),
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(json["fileName"], "a.wav");
        assert_eq!(json["fileType"], "audio/wav");
    }

    #[test]
    fn test_error_payload_hides_internal_details() {
        let msg = SyncMessage::error("t", &TrackError::Internal("rocksdb at /srv/db".into())).unwrap();
        let payload = msg.error_payload().unwrap();
        assert_eq!(payload.kind, ErrorKind::Internal);
        assert!(!payload.message.contains("/srv/db"));

        let msg = SyncMessage::error("t", &TrackError::NotFound("take x".into())).unwrap();
        assert!(matches!(
            msg.error_payload().unwrap().into_error(),
            TrackError::NotFound(_)
        ));
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let ping = SyncMessage::ping(Uuid::new_v4(), "t");
        assert_eq!(
            ping.track_op().unwrap_err(),
            ProtocolError::InvalidMessageType(MessageType::Ping)
        );
        assert!(ping.awareness_message().is_err());
        assert!(ping.upload_credential().is_err());
    }

    #[test]
    fn test_garbage_mutation_is_deserialization_error() {
        let mut msg = SyncMessage::ping(Uuid::new_v4(), "t");
        msg.msg_type = MessageType::Mutation;
        msg.payload = b"{\"op\":\"explode\"}".to_vec();
        let err = msg.track_op().unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
        assert!(matches!(TrackError::from(err), TrackError::InvalidRequest(_)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_update_header_is_small() {
        let msg = SyncMessage::update(Uuid::new_v4(), "track-42", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "encoded size {}", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Mutation as u8, 5);
        assert_eq!(MessageType::Pong as u8, 10);
    }
}
