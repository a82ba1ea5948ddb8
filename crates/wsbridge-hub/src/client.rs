//! Client facade: the single-connection counterpart of `ServerFacade`.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};
use wsbridge_core::{
    BridgeError, CLOSE_NORMAL, CloseDetail, CloseInitiator, ConnectionId, ConnectionSink,
    ConnectionState, Event, Message, Result, SinkError,
};

use crate::listener::{DispatchReport, Listener, ListenerId, ListenerSet};

struct Link {
    id: ConnectionId,
    sink: Arc<dyn ConnectionSink>,
    state: ConnectionState,
}

/// Bridges one outbound connection to listeners.
///
/// Events carry no connection handle: there is only one connection, and
/// `send_*`/`close` always target it. Opened and Closed events carry a
/// summary naming the remote endpoint.
pub struct ClientFacade {
    remote: String,
    listeners: ListenerSet,
    link: Mutex<Option<Link>>,
}

impl ClientFacade {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            listeners: ListenerSet::new(),
            link: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn subscribe<L: Listener + 'static>(&self, listener: L) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn subscribe_arc(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.listeners.subscribe_arc(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.link.lock().as_ref().map(|link| link.id)
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.link.lock().as_ref().map(|link| link.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == Some(ConnectionState::Open)
    }

    // ── Transport callbacks ───────────────────────────────────────────────

    pub fn on_transport_open(&self, sink: Arc<dyn ConnectionSink>) -> Result<ConnectionId> {
        let id = {
            let mut link = self.link.lock();
            if let Some(existing) = link.as_ref().filter(|l| l.state != ConnectionState::Closed) {
                return Err(BridgeError::DuplicateIdentifier(existing.id));
            }
            let id = ConnectionId::new();
            *link = Some(Link {
                id,
                sink,
                state: ConnectionState::Open,
            });
            id
        };
        info!(conn_id = %id, remote = %self.remote, "connected");

        let summary = format!("Connected to server at {}", self.remote);
        self.listeners.dispatch(&Event::opened(None, summary));
        Ok(id)
    }

    pub fn on_transport_message(&self, message: Message) -> DispatchReport {
        self.listeners.dispatch(&Event::message(None, message))
    }

    pub fn on_transport_error(&self, description: impl Into<String>) -> DispatchReport {
        let description = description.into();
        debug!(remote = %self.remote, error = %description, "transport error");
        self.listeners.dispatch(&Event::error(None, description))
    }

    pub fn on_transport_close(
        &self,
        code: u16,
        reason: impl Into<String>,
        initiator: CloseInitiator,
    ) -> DispatchReport {
        let summary = format!("Disconnected from server at {}", self.remote);
        let detail = CloseDetail::new(code, reason, initiator);
        let report = self.listeners.dispatch(&Event::closed(None, summary, detail));

        if let Some(link) = self.link.lock().as_mut() {
            link.state = ConnectionState::Closed;
        }
        info!(remote = %self.remote, code, ?initiator, "disconnected");
        report
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        let (id, sink) = self.live_sink()?;
        let sent = match message.into() {
            Message::Text(text) => sink.send_text(&text),
            Message::Binary(data) => sink.send_binary(data),
        };
        sent.map_err(|e| BridgeError::send_failed(id, e))
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(text)
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into()))
    }

    pub fn close(&self) -> Result<()> {
        self.close_with(CLOSE_NORMAL, "")
    }

    /// Request a close. Repeated requests while closing are no-ops.
    pub fn close_with(&self, code: u16, reason: &str) -> Result<()> {
        let (id, sink) = {
            let mut guard = self.link.lock();
            let link = guard.as_mut().ok_or(BridgeError::NotConnected)?;
            match link.state {
                ConnectionState::Open => link.state = ConnectionState::Closing,
                ConnectionState::Closing => return Ok(()),
                ConnectionState::Closed => {
                    return Err(BridgeError::close_failed(link.id, SinkError::Closed));
                }
            }
            (link.id, link.sink.clone())
        };
        sink.close(code, reason)
            .map_err(|e| BridgeError::close_failed(id, e))
    }

    fn live_sink(&self) -> Result<(ConnectionId, Arc<dyn ConnectionSink>)> {
        let guard = self.link.lock();
        match guard.as_ref() {
            None => Err(BridgeError::NotConnected),
            Some(link) if link.state == ConnectionState::Closed => {
                Err(BridgeError::send_failed(link.id, SinkError::Closed))
            }
            Some(link) => Ok((link.id, link.sink.clone())),
        }
    }
}
