//! JSON wire protocol for chat fan-out.
//!
//! Every frame is a single WebSocket text frame carrying an envelope:
//! ```text
//! { "msgType": "create" | "edit" | "delete", "payload": <type-specific> }
//! ```
//!
//! | msgType  | request payload              | broadcast payload    |
//! |----------|------------------------------|----------------------|
//! | create   | `{id, author, content, time}`| `{id, author, content, time}` |
//! | edit     | `{msgId, author, content}`   | `{msgId, content}`   |
//! | delete   | `{msgId, author}`            | `{msgId}`            |
//!
//! Inbound decoding is two-phase: the envelope is parsed first, then the
//! payload according to `msgType`. This lets the session loop tell a
//! malformed frame apart from a well-formed frame of an unknown type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat message as persisted by the store and broadcast to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the store on create; whatever the client sends is replaced.
    #[serde(default)]
    pub id: String,
    pub author: String,
    pub content: String,
    /// Client-supplied creation timestamp, never modified by the server.
    #[serde(default)]
    pub time: i64,
}

impl Message {
    pub fn new(author: impl Into<String>, content: impl Into<String>, time: i64) -> Self {
        Self {
            id: String::new(),
            author: author.into(),
            content: content.into(),
            time,
        }
    }
}

/// Edit request: only the author of `msg_id` may change its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub author: String,
    pub content: String,
}

/// Delete request: only the author of `msg_id` may remove it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub author: String,
}

/// Broadcast payload for an accepted edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditNotice {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub content: String,
}

/// Broadcast payload for an accepted delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNotice {
    #[serde(rename = "msgId")]
    pub msg_id: String,
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Create,
    Edit,
    Delete,
}

impl MessageKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "create" => Some(Self::Create),
            "edit" => Some(Self::Edit),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "msgType", content = "payload", rename_all = "lowercase")]
pub enum ClientRequest {
    Create(Message),
    Edit(EditRequest),
    Delete(DeleteRequest),
}

/// Envelope as it arrives, before the payload is interpreted.
///
/// `reqType` is the tag name older browser clients send.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "msgType", alias = "reqType")]
    msg_type: String,
    #[serde(default)]
    payload: Value,
}

impl ClientRequest {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Create(_) => MessageKind::Create,
            Self::Edit(_) => MessageKind::Edit,
            Self::Delete(_) => MessageKind::Delete,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a text frame.
    ///
    /// Returns [`ProtocolError::UnknownType`] for a well-formed envelope with
    /// an unrecognised tag and [`ProtocolError::Decode`] for anything else
    /// that does not parse.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let kind = MessageKind::parse(&raw.msg_type)
            .ok_or_else(|| ProtocolError::UnknownType(raw.msg_type.clone()))?;

        let decode_err = |e: serde_json::Error| {
            ProtocolError::Decode(format!("invalid {} payload: {e}", kind.as_str()))
        };

        match kind {
            MessageKind::Create => serde_json::from_value(raw.payload)
                .map(Self::Create)
                .map_err(decode_err),
            MessageKind::Edit => serde_json::from_value(raw.payload)
                .map(Self::Edit)
                .map_err(decode_err),
            MessageKind::Delete => serde_json::from_value(raw.payload)
                .map(Self::Delete)
                .map_err(decode_err),
        }
    }
}

/// Server → client broadcast envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgType", content = "payload", rename_all = "lowercase")]
pub enum ServerEvent {
    Create(Message),
    Edit(EditNotice),
    Delete(DeleteNotice),
}

impl ServerEvent {
    pub fn created(msg: Message) -> Self {
        Self::Create(msg)
    }

    pub fn edited(msg_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Edit(EditNotice {
            msg_id: msg_id.into(),
            content: content.into(),
        })
    }

    pub fn deleted(msg_id: impl Into<String>) -> Self {
        Self::Delete(DeleteNotice {
            msg_id: msg_id.into(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Create(_) => MessageKind::Create,
            Self::Edit(_) => MessageKind::Edit,
            Self::Delete(_) => MessageKind::Delete,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a text frame received from the server.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
