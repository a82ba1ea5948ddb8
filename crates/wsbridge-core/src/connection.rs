//! Connection identity, lifecycle state, and the outbound send path.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BridgeError, Result};
use crate::event::{CLOSE_NORMAL, Message};

/// Opaque identifier for one live connection.
///
/// Generated fresh for every accepted connection and never derived from the
/// peer address, so a reconnect from the same host:port gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    /// A local close was requested; waiting for the transport to confirm.
    Closing,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Failure reported by the transport's per-connection send path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Outbound half of a connection, supplied by the transport.
///
/// Implementations must be callable from any thread and must not block for
/// long; the transport owns framing and the actual socket write.
pub trait ConnectionSink: Send + Sync + 'static {
    fn send_text(&self, text: &str) -> std::result::Result<(), SinkError>;

    fn send_binary(&self, data: Bytes) -> std::result::Result<(), SinkError>;

    /// Begin a close handshake. Best effort.
    fn close(&self, code: u16, reason: &str) -> std::result::Result<(), SinkError>;
}

struct HandleInner {
    id: ConnectionId,
    remote_addr: SocketAddr,
    opened_at: DateTime<Utc>,
    state: AtomicU8,
    sink: Arc<dyn ConnectionSink>,
}

/// Shared handle to one live connection.
///
/// Cloning is cheap; every clone observes the same state. The registry owns
/// the authoritative copy, events carry clones so listeners can reply.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, sink: Arc<dyn ConnectionSink>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                remote_addr,
                opened_at: Utc::now(),
                state: AtomicU8::new(ConnectionState::Open.to_u8()),
                sink,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_not_closed()
            .and_then(|()| self.inner.sink.send_text(text))
            .map_err(|e| BridgeError::send_failed(self.id(), e))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.ensure_not_closed()
            .and_then(|()| self.inner.sink.send_binary(data))
            .map_err(|e| BridgeError::send_failed(self.id(), e))
    }

    pub fn send(&self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_text(&text),
            Message::Binary(data) => self.send_binary(data),
        }
    }

    /// Request a normal (1000) close.
    pub fn close(&self) -> Result<()> {
        self.close_with(CLOSE_NORMAL, "")
    }

    /// Request a close with an explicit code and reason.
    ///
    /// A second request while the first is still pending is a no-op.
    pub fn close_with(&self, code: u16, reason: &str) -> Result<()> {
        let swapped = self.inner.state.compare_exchange(
            ConnectionState::Open.to_u8(),
            ConnectionState::Closing.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match swapped.map(ConnectionState::from_u8) {
            Ok(_) => self
                .inner
                .sink
                .close(code, reason)
                .map_err(|e| BridgeError::close_failed(self.id(), e)),
            Err(current) => match ConnectionState::from_u8(current) {
                ConnectionState::Closing => Ok(()),
                _ => Err(BridgeError::close_failed(self.id(), SinkError::Closed)),
            },
        }
    }

    /// Record that the transport finished closing this connection.
    pub fn mark_closed(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed.to_u8(), Ordering::Release);
    }

    fn ensure_not_closed(&self) -> std::result::Result<(), SinkError> {
        match self.state() {
            ConnectionState::Closed => Err(SinkError::Closed),
            _ => Ok(()),
        }
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
