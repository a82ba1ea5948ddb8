//! Transport-level errors.

use thiserror::Error;
use wsbridge_core::BridgeError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to load TLS certificate or key: {0}")]
    Tls(#[source] std::io::Error),

    #[error("server task exited before it started listening")]
    NotListening,

    #[error("websocket handshake failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("facade callback panicked")]
    CallbackPanicked,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
