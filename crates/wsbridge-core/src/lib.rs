//! wsbridge core types
//!
//! Connection identity, the per-connection send path, the immutable event
//! record handed to listeners, and the error taxonomy shared by the hub and
//! transport crates. Nothing in this crate performs I/O; the transport layer
//! plugs in through the `ConnectionSink` trait.

pub mod connection;
pub mod error;
pub mod event;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionSink, ConnectionState, SinkError};
pub use error::{BridgeError, Result};
pub use event::{
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NO_STATUS, CLOSE_NORMAL, CloseDetail, CloseInitiator, Event,
    EventKind, EventRecord, Message, Payload,
};
