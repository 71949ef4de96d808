//! Wire protocol: tagged JSON frames in and out of a session.
//!
//! Inbound frames are parsed into [`ClientMessage`] then structurally
//! validated; unknown `type` tags are rejected by `serde` itself, and every
//! other bound (string length, payload size, non-negative fields) is
//! re-checked explicitly so a single bad frame always yields a named field
//! and a `validation_failed` reason, never a panic.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorReason, ValidationError};
use crate::ot::Operation;

const ID_MIN_LEN: usize = 1;
const ID_MAX_LEN: usize = 100;
const MAX_OP_PAYLOAD_LEN: usize = 10_000;

/// The operation payload embedded in an inbound `OT_OP` frame.
///
/// Unlike [`Operation`], this has no `clientId`/`userId` — those are filled
/// in by the session from the enclosing message before the op reaches the
/// room/engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    pub id: String,
    pub version: u64,
    pub kind: crate::ot::OpKind,
    pub position: u64,
    pub payload: String,
}

/// A cursor position within the document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

/// A text selection range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// A frame received from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "JOIN_ROOM")]
    JoinRoom {
        room_id: String,
        client_id: String,
        user_id: String,
    },
    #[serde(rename = "LEAVE_ROOM")]
    LeaveRoom { room_id: String, client_id: String },
    #[serde(rename = "OT_OP")]
    OtOp {
        room_id: String,
        client_id: String,
        operation: OperationPayload,
    },
    #[serde(rename = "CURSOR_UPDATE")]
    CursorUpdate {
        room_id: String,
        client_id: String,
        #[serde(default)]
        cursor: Option<Cursor>,
        #[serde(default)]
        selection: Option<Selection>,
    },
    #[serde(rename = "SYNC_STATE")]
    SyncState {
        room_id: String,
        client_id: String,
        #[serde(default)]
        from_version: Option<u64>,
    },
    #[serde(rename = "PING")]
    Ping {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

impl ClientMessage {
    /// The room a message pertains to, if any (`PING` has none).
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::LeaveRoom { room_id, .. }
            | ClientMessage::OtOp { room_id, .. }
            | ClientMessage::CursorUpdate { room_id, .. }
            | ClientMessage::SyncState { room_id, .. } => Some(room_id),
            ClientMessage::Ping { .. } => None,
        }
    }
}

/// Participant summary embedded in a `JOIN_ROOM_ACK` frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub client_id: String,
    pub user_id: Option<String>,
}

/// An accepted op as it appears on the wire (distinct from the internal
/// [`Operation`] only in field order/name, kept separate so the two shapes
/// can diverge independently).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationWire {
    pub id: String,
    pub kind: crate::ot::OpKind,
    pub position: u64,
    pub payload: String,
    pub client_id: String,
    pub version: u64,
}

impl From<&Operation> for OperationWire {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            kind: op.kind,
            position: op.position,
            payload: op.payload.clone(),
            client_id: op.client_id.clone(),
            version: op.version,
        }
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "JOIN_ROOM_ACK")]
    JoinRoomAck {
        room_id: String,
        content: String,
        version: u64,
        participants: Vec<ParticipantSummary>,
    },
    #[serde(rename = "ACK")]
    Ack {
        room_id: String,
        operation_id: String,
        version: u64,
    },
    #[serde(rename = "OT_OP_BROADCAST")]
    OtOpBroadcast {
        room_id: String,
        operation: OperationWire,
        version: u64,
        sender_client_id: String,
    },
    #[serde(rename = "CURSOR_UPDATE_BROADCAST")]
    CursorUpdateBroadcast {
        room_id: String,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },
    #[serde(rename = "PARTICIPANT_JOINED")]
    ParticipantJoined {
        room_id: String,
        client_id: String,
        user_id: Option<String>,
    },
    #[serde(rename = "PARTICIPANT_LEFT")]
    ParticipantLeft { room_id: String, client_id: String },
    #[serde(rename = "ERROR")]
    Error {
        reason: ErrorReason,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
    },
    #[serde(rename = "BACKPRESSURE")]
    Backpressure { room_id: String },
    #[serde(rename = "PONG")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    /// Build an `ERROR` frame for the given reason.
    pub fn error(reason: ErrorReason, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            reason,
            message: message.into(),
            operation_id: None,
        }
    }

    /// Build an `ERROR` frame correlated to a specific rejected operation.
    pub fn op_error(reason: ErrorReason, message: impl Into<String>, operation_id: String) -> Self {
        ServerMessage::Error {
            reason,
            message: message.into(),
            operation_id: Some(operation_id),
        }
    }
}

fn validate_id(field: &str, value: &str) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < ID_MIN_LEN || len > ID_MAX_LEN {
        return Err(ValidationError::new(
            field,
            format!("must be {ID_MIN_LEN}..{ID_MAX_LEN} characters, got {len}"),
        ));
    }
    Ok(())
}

/// Parse a raw frame and structurally validate it against the protocol's bounds.
///
/// A JSON parse failure and a bound violation both surface as a single
/// [`ValidationError`] — there is no separate "malformed" case the caller
/// needs to handle: the validator is total, never panics.
pub fn parse_and_validate(raw: &str) -> Result<ClientMessage, ValidationError> {
    let msg: ClientMessage = serde_json::from_str(raw)
        .map_err(|e| ValidationError::new("<frame>", format!("malformed frame: {e}")))?;
    validate(&msg)?;
    Ok(msg)
}

/// Re-check the structural bounds of an already-parsed message.
pub fn validate(msg: &ClientMessage) -> Result<(), ValidationError> {
    match msg {
        ClientMessage::JoinRoom {
            room_id,
            client_id,
            user_id,
        } => {
            validate_id("roomId", room_id)?;
            validate_id("clientId", client_id)?;
            validate_id("userId", user_id)?;
        }
        ClientMessage::LeaveRoom { room_id, client_id } => {
            validate_id("roomId", room_id)?;
            validate_id("clientId", client_id)?;
        }
        ClientMessage::OtOp {
            room_id,
            client_id,
            operation,
        } => {
            validate_id("roomId", room_id)?;
            validate_id("clientId", client_id)?;
            validate_id("operation.id", &operation.id)?;
            if operation.payload.is_empty() && matches!(operation.kind, crate::ot::OpKind::Insert) {
                return Err(ValidationError::new(
                    "operation.payload",
                    "insert payload must not be empty",
                ));
            }
            if operation.payload.len() > MAX_OP_PAYLOAD_LEN {
                return Err(ValidationError::new(
                    "operation.payload",
                    format!("payload exceeds {MAX_OP_PAYLOAD_LEN} bytes"),
                ));
            }
        }
        ClientMessage::CursorUpdate {
            room_id,
            client_id,
            cursor,
            selection,
        } => {
            validate_id("roomId", room_id)?;
            validate_id("clientId", client_id)?;
            if cursor.is_none() && selection.is_none() {
                return Err(ValidationError::new(
                    "cursor",
                    "must supply a cursor or a selection",
                ));
            }
        }
        ClientMessage::SyncState {
            room_id, client_id, ..
        } => {
            validate_id("roomId", room_id)?;
            validate_id("clientId", client_id)?;
        }
        ClientMessage::Ping { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_rejected_not_panicked() {
        let err = parse_and_validate(r#"{"type":"BOGUS"}"#).unwrap_err();
        assert!(err.reason.contains("malformed"));
    }

    #[test]
    fn missing_field_is_rejected() {
        let err = parse_and_validate(r#"{"type":"JOIN_ROOM","roomId":"r"}"#).unwrap_err();
        assert_eq!(err.field, "<frame>");
    }

    #[test]
    fn join_room_parses_and_validates() {
        let msg = parse_and_validate(
            r#"{"type":"JOIN_ROOM","roomId":"doc-1","clientId":"c-A","userId":"u-1"}"#,
        )
        .unwrap();
        assert_eq!(msg.room_id(), Some("doc-1"));
    }

    #[test]
    fn empty_room_id_is_rejected() {
        let err = parse_and_validate(
            r#"{"type":"JOIN_ROOM","roomId":"","clientId":"c-A","userId":"u-1"}"#,
        )
        .unwrap_err();
        assert_eq!(err.field, "roomId");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = "x".repeat(10_001);
        let raw = serde_json::json!({
            "type": "OT_OP",
            "roomId": "r",
            "clientId": "c",
            "operation": { "id": "o1", "version": 0, "kind": "insert", "position": 0, "payload": payload }
        })
        .to_string();
        let err = parse_and_validate(&raw).unwrap_err();
        assert_eq!(err.field, "operation.payload");
    }

    #[test]
    fn empty_insert_payload_is_rejected() {
        let raw = serde_json::json!({
            "type": "OT_OP",
            "roomId": "r",
            "clientId": "c",
            "operation": { "id": "o1", "version": 0, "kind": "insert", "position": 0, "payload": "" }
        })
        .to_string();
        let err = parse_and_validate(&raw).unwrap_err();
        assert_eq!(err.field, "operation.payload");
    }

    #[test]
    fn broadcast_serializes_with_the_documented_field_names() {
        let op = Operation {
            id: "op-7".into(),
            kind: crate::ot::OpKind::Insert,
            position: 5,
            payload: "Hello".into(),
            client_id: "c-B".into(),
            user_id: None,
            version: 42,
        };
        let msg = ServerMessage::OtOpBroadcast {
            room_id: "doc-123".into(),
            operation: OperationWire::from(&op),
            version: 43,
            sender_client_id: "c-B".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "OT_OP_BROADCAST");
        assert_eq!(json["operation"]["id"], "op-7");
        assert_eq!(json["version"], 43);
    }
}
