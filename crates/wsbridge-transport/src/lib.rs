//! wsbridge transport layer
//!
//! Supplies the WebSocket engine the hub facades sit on:
//! - an axum server (plain or TLS) that feeds a `ServerFacade`
//! - a tokio-tungstenite client that feeds a `ClientFacade`
//!
//! Each connection is served by one reader task and one writer task. The
//! reader invokes facade callbacks on the blocking pool and awaits each one
//! before reading the next frame, which keeps per-connection event order and
//! keeps slow listeners off the async workers. Outbound frames travel through
//! a bounded channel (`ChannelSink`) to the writer.

pub mod channel;
pub mod client;
pub mod error;
pub mod server;
mod tls;

pub use channel::{ChannelSink, Outbound};
pub use client::{ClientConfig, TransportClient};
pub use error::TransportError;
pub use server::{TlsConfig, TransportConfig, TransportServer};
