//! Server facade: many connections, one listener set.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use wsbridge_core::{
    BridgeError, CloseDetail, CloseInitiator, ConnectionHandle, ConnectionId, ConnectionSink,
    Event, Message, Result,
};

use crate::listener::{DispatchReport, Listener, ListenerId, ListenerSet};
use crate::registry::ConnectionRegistry;

/// Result of a broadcast send or close. Per-connection failures are
/// collected rather than aborting the loop.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<BridgeError>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Bridges a multi-connection transport to listeners.
///
/// The transport calls the `on_transport_*` methods from its own threads;
/// for a given connection it must not issue the next call until the previous
/// one returns. Calls for different connections may run concurrently.
pub struct ServerFacade {
    registry: ConnectionRegistry,
    listeners: ListenerSet,
}

impl ServerFacade {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            listeners: ListenerSet::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
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

    // ── Transport callbacks ───────────────────────────────────────────────

    /// A connection finished its handshake.
    pub fn on_transport_open(
        &self,
        id: ConnectionId,
        remote_addr: SocketAddr,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<ConnectionHandle> {
        let handle = ConnectionHandle::new(id, remote_addr, sink);
        self.registry.register(handle.clone())?;
        info!(conn_id = %id, remote = %remote_addr, "connection opened");

        let summary = format!("Client {id} at {remote_addr} opened a connection");
        self.listeners.dispatch(&Event::opened(Some(handle.clone()), summary));
        Ok(handle)
    }

    pub fn on_transport_message(&self, id: ConnectionId, message: Message) -> Result<DispatchReport> {
        let handle = self.registry.lookup(id).inspect_err(|_| {
            warn!(conn_id = %id, "message for unregistered connection dropped");
        })?;
        Ok(self.listeners.dispatch(&Event::message(Some(handle), message)))
    }

    /// Report a transport fault. Does not close the connection; a fatal fault
    /// is followed by a separate `on_transport_close`.
    ///
    /// `id` is `None` for faults not tied to one connection (accept errors).
    pub fn on_transport_error(
        &self,
        id: Option<ConnectionId>,
        description: impl Into<String>,
    ) -> DispatchReport {
        let handle = id.and_then(|id| self.registry.lookup(id).ok());
        let description = description.into();
        debug!(conn_id = ?id, error = %description, "transport error");
        self.listeners.dispatch(&Event::error(handle, description))
    }

    /// A connection is gone. Listeners see the Closed event while the id is
    /// still registered; it is removed once dispatch returns.
    pub fn on_transport_close(
        &self,
        id: ConnectionId,
        code: u16,
        reason: impl Into<String>,
        initiator: CloseInitiator,
    ) -> Result<DispatchReport> {
        let handle = self.registry.lookup(id).inspect_err(|_| {
            warn!(conn_id = %id, "close for unregistered connection ignored");
        })?;
        let addr = handle.remote_addr();
        let summary = match initiator {
            CloseInitiator::Remote => format!("Client {id} at {addr} closed the connection"),
            CloseInitiator::Local => format!("Closed connection to client {id} at {addr}"),
        };
        let detail = CloseDetail::new(code, reason, initiator);

        let report = self
            .listeners
            .dispatch(&Event::closed(Some(handle.clone()), summary, detail));

        handle.mark_closed();
        self.registry.unregister(id);
        info!(conn_id = %id, code, ?initiator, "connection closed");
        Ok(report)
    }

    // ── Addressed operations ──────────────────────────────────────────────

    pub fn lookup(&self, id: ConnectionId) -> Result<ConnectionHandle> {
        self.registry.lookup(id)
    }

    pub fn send_to(&self, id: ConnectionId, message: impl Into<Message>) -> Result<()> {
        self.registry.lookup(id)?.send(message.into())
    }

    pub fn close_one(&self, id: ConnectionId) -> Result<()> {
        self.registry.lookup(id)?.close()
    }

    pub fn close_one_with(&self, id: ConnectionId, code: u16, reason: &str) -> Result<()> {
        self.registry.lookup(id)?.close_with(code, reason)
    }

    // ── Broadcast operations ──────────────────────────────────────────────

    pub fn send_to_all(&self, message: impl Into<Message>) -> BroadcastReport {
        let message = message.into();
        let report = self.for_each_connection(|handle| handle.send(message.clone()));
        debug!(
            recipients = report.delivered,
            failed = report.failures.len(),
            bytes = message.len(),
            "broadcast message"
        );
        report
    }

    pub fn close_all(&self) -> BroadcastReport {
        let report = self.for_each_connection(ConnectionHandle::close);
        debug!(
            closed = report.delivered,
            failed = report.failures.len(),
            "closed all connections"
        );
        report
    }

    pub fn close_all_with(&self, code: u16, reason: &str) -> BroadcastReport {
        self.for_each_connection(|handle| handle.close_with(code, reason))
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    fn for_each_connection<F>(&self, mut op: F) -> BroadcastReport
    where
        F: FnMut(&ConnectionHandle) -> Result<()>,
    {
        let mut report = BroadcastReport::default();
        for handle in self.registry.snapshot() {
            match op(&handle) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(conn_id = %handle.id(), error = %e, "broadcast target failed");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}

impl Default for ServerFacade {
    fn default() -> Self {
        Self::new()
    }
}
