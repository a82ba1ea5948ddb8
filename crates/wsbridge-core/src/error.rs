//! Bridge error taxonomy.

use thiserror::Error;

use crate::connection::{ConnectionId, SinkError};

/// Errors surfaced by addressed operations, the registry, and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The id is not registered (already closed, or never existed).
    #[error("no connection with id {0}")]
    ConnectionNotFound(ConnectionId),

    /// The transport reported an open for an id that is still registered.
    #[error("connection id {0} is already registered")]
    DuplicateIdentifier(ConnectionId),

    #[error("send to connection {id} failed: {source}")]
    SendFailed {
        id: ConnectionId,
        #[source]
        source: SinkError,
    },

    #[error("close of connection {id} failed: {source}")]
    CloseFailed {
        id: ConnectionId,
        #[source]
        source: SinkError,
    },

    /// A subscribed listener returned an error or panicked.
    #[error("listener '{listener}' failed: {message}")]
    ListenerFailure { listener: String, message: String },

    /// Single-connection operation attempted while no connection is open.
    #[error("not connected")]
    NotConnected,
}

impl BridgeError {
    pub fn send_failed(id: ConnectionId, source: SinkError) -> Self {
        Self::SendFailed { id, source }
    }

    pub fn close_failed(id: ConnectionId, source: SinkError) -> Self {
        Self::CloseFailed { id, source }
    }

    pub fn listener_failure(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ListenerFailure {
            listener: listener.into(),
            message: message.into(),
        }
    }

    /// The connection this error refers to, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::ConnectionNotFound(id)
            | Self::DuplicateIdentifier(id)
            | Self::SendFailed { id, .. }
            | Self::CloseFailed { id, .. } => Some(*id),
            Self::ListenerFailure { .. } | Self::NotConnected => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ConnectionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
