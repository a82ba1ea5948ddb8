//! Outbound frame queue shared by the server and client transports.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error};
use wsbridge_core::{ConnectionId, ConnectionSink, SinkError};

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// `ConnectionSink` backed by a bounded channel.
///
/// Sends never block: a full queue is reported as `SinkError::QueueFull` and
/// a finished writer as `SinkError::Closed`.
pub struct ChannelSink {
    tx: mpsc::Sender<Outbound>,
    closed_locally: AtomicBool,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            closed_locally: AtomicBool::new(false),
        });
        (sink, rx)
    }

    /// True once a close frame has been queued from this side.
    pub fn closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }

    fn push(&self, frame: Outbound) -> Result<(), SinkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::QueueFull,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

impl ConnectionSink for ChannelSink {
    fn send_text(&self, text: &str) -> Result<(), SinkError> {
        self.push(Outbound::Text(text.to_string()))
    }

    fn send_binary(&self, data: Bytes) -> Result<(), SinkError> {
        self.push(Outbound::Binary(data))
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), SinkError> {
        self.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        })?;
        self.closed_locally.store(true, Ordering::Release);
        Ok(())
    }
}

/// Drain queued frames into the socket until the queue closes, a write
/// fails, or a close frame has been written.
pub(crate) async fn write_loop<S, M, F>(
    mut socket: S,
    mut rx: mpsc::Receiver<Outbound>,
    conn_id: ConnectionId,
    encode: F,
) where
    S: Sink<M> + Unpin,
    S::Error: Display,
    F: Fn(Outbound) -> M,
{
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Outbound::Close { .. });
        if let Err(e) = socket.send(encode(frame)).await {
            debug!(conn_id = %conn_id, error = %e, "write failed, stopping writer");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Run a facade callback on the blocking pool and wait for it.
///
/// Listener code is synchronous and may block; this keeps it off the async
/// workers while preserving per-connection ordering, since the caller awaits
/// each callback before reading the next frame.
pub(crate) async fn on_blocking<T, F>(f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            error!(error = %e, "facade callback panicked");
            None
        }
    }
}
