//! Immutable events handed to listeners.
//!
//! An `Event` is built by a facade from one transport callback, fanned out to
//! every subscribed listener, and then dropped. Constructors keep the kind and
//! payload in agreement; there is no way to build a `TextMessage` carrying a
//! binary payload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionHandle, ConnectionId};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (server shutdown, client navigating off).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame arrived without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Opened,
    TextMessage,
    BinaryMessage,
    Error,
    Closed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::TextMessage => "textMessage",
            Self::BinaryMessage => "binaryMessage",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A text or binary message, inbound from the transport or outbound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

/// Event payload. Opened and Closed carry a human-readable summary as `Text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
    Error(String),
}

/// Which side started the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseInitiator {
    Remote,
    Local,
}

/// Structured close information attached to every `Closed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseDetail {
    pub code: u16,
    pub reason: String,
    pub initiator: CloseInitiator,
}

impl CloseDetail {
    pub fn new(code: u16, reason: impl Into<String>, initiator: CloseInitiator) -> Self {
        Self {
            code,
            reason: reason.into(),
            initiator,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.initiator == CloseInitiator::Remote
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    connection: Option<ConnectionHandle>,
    payload: Payload,
    close: Option<CloseDetail>,
    timestamp: DateTime<Utc>,
}

impl Event {
    fn build(
        kind: EventKind,
        connection: Option<ConnectionHandle>,
        payload: Payload,
        close: Option<CloseDetail>,
    ) -> Self {
        Self {
            kind,
            connection,
            payload,
            close,
            timestamp: Utc::now(),
        }
    }

    pub fn opened(connection: Option<ConnectionHandle>, summary: impl Into<String>) -> Self {
        Self::build(EventKind::Opened, connection, Payload::Text(summary.into()), None)
    }

    pub fn text_message(connection: Option<ConnectionHandle>, text: impl Into<String>) -> Self {
        Self::build(EventKind::TextMessage, connection, Payload::Text(text.into()), None)
    }

    pub fn binary_message(connection: Option<ConnectionHandle>, data: impl Into<Bytes>) -> Self {
        Self::build(EventKind::BinaryMessage, connection, Payload::Binary(data.into()), None)
    }

    /// Build a TextMessage or BinaryMessage event from an inbound message.
    pub fn message(connection: Option<ConnectionHandle>, message: Message) -> Self {
        match message {
            Message::Text(text) => Self::text_message(connection, text),
            Message::Binary(data) => Self::binary_message(connection, data),
        }
    }

    pub fn error(connection: Option<ConnectionHandle>, description: impl Into<String>) -> Self {
        Self::build(EventKind::Error, connection, Payload::Error(description.into()), None)
    }

    pub fn closed(
        connection: Option<ConnectionHandle>,
        summary: impl Into<String>,
        detail: CloseDetail,
    ) -> Self {
        Self::build(
            EventKind::Closed,
            connection,
            Payload::Text(summary.into()),
            Some(detail),
        )
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Originating connection. `None` for client-side events.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(ConnectionHandle::id)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Message text, or the summary for Opened/Closed.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn binary(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn error_description(&self) -> Option<&str> {
        match &self.payload {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn close_detail(&self) -> Option<&CloseDetail> {
        self.close.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn to_record(&self) -> EventRecord {
        let (text, binary_len, error) = match &self.payload {
            Payload::Text(t) => (Some(t.clone()), None, None),
            Payload::Binary(b) => (None, Some(b.len()), None),
            Payload::Error(e) => (None, None, Some(e.clone())),
        };
        EventRecord {
            kind: self.kind,
            connection_id: self.connection_id(),
            text,
            binary_len,
            error,
            close: self.close.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Serializable view of an `Event`, used for JSON-lines output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<CloseDetail>,
    pub timestamp: DateTime<Utc>,
}
