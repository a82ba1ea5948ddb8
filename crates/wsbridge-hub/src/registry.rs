//! ConnectionRegistry: the authoritative set of live connections.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error};
use wsbridge_core::{BridgeError, ConnectionHandle, ConnectionId, Result};

/// Internal entry: remembers registration order for stable snapshots.
struct RegistryEntry {
    seq: u64,
    handle: ConnectionHandle,
}

/// Maps connection ids to live handles.
///
/// Mutated from transport threads (register on open, unregister on close)
/// and read from application threads. No method holds a shard lock beyond
/// the call itself, so callers may iterate a `snapshot()` while other
/// threads register and unregister.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, RegistryEntry>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Add a newly opened connection.
    ///
    /// An id that is already present is an invariant violation on the
    /// transport side; the new handle is rejected and the old one kept.
    pub fn register(&self, handle: ConnectionHandle) -> Result<()> {
        let id = handle.id();
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                error!(conn_id = %id, "duplicate connection id, registration rejected");
                Err(BridgeError::DuplicateIdentifier(id))
            }
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(RegistryEntry { seq, handle });
                debug!(conn_id = %id, "connection registered");
                Ok(())
            }
        }
    }

    /// Remove a connection. Absent ids are not an error: close notifications
    /// race with explicit close requests.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(&id).map(|(_, entry)| entry.handle);
        if removed.is_some() {
            debug!(conn_id = %id, "connection unregistered");
        }
        removed
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<ConnectionHandle> {
        self.connections
            .get(&id)
            .map(|entry| entry.handle.clone())
            .ok_or(BridgeError::ConnectionNotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Point-in-time copy of all live handles, in registration order.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let mut entries: Vec<(u64, ConnectionHandle)> = self
            .connections
            .iter()
            .map(|entry| (entry.seq, entry.handle.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, handle)| handle).collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot().iter().map(ConnectionHandle::id).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use wsbridge_core::{ConnectionSink, SinkError};

    use super::*;

    struct NullSink;

    impl ConnectionSink for NullSink {
        fn send_text(&self, _text: &str) -> std::result::Result<(), SinkError> {
            Ok(())
        }

        fn send_binary(&self, _data: Bytes) -> std::result::Result<(), SinkError> {
            Ok(())
        }

        fn close(&self, _code: u16, _reason: &str) -> std::result::Result<(), SinkError> {
            Ok(())
        }
    }

    fn make_handle() -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionId::new(),
            "127.0.0.1:4000".parse().unwrap(),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let handle = make_handle();
        registry.register(handle.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(handle.id()).unwrap(), handle);
    }

    #[test]
    fn duplicate_register_keeps_original() {
        let registry = ConnectionRegistry::new();
        let handle = make_handle();
        registry.register(handle.clone()).unwrap();

        let err = registry.register(handle.clone()).unwrap_err();
        assert_eq!(err, BridgeError::DuplicateIdentifier(handle.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        assert_eq!(
            registry.lookup(id).unwrap_err(),
            BridgeError::ConnectionNotFound(id)
        );
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let handle = make_handle();
        registry.register(handle.clone()).unwrap();

        assert!(registry.unregister(handle.id()).is_some());
        assert!(registry.unregister(handle.id()).is_none());
        assert!(registry.is_empty());
        assert!(registry.lookup(handle.id()).is_err());
    }

    #[test]
    fn snapshot_follows_registration_order() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8).map(|_| make_handle()).collect();
        for h in &handles {
            registry.register(h.clone()).unwrap();
        }
        registry.unregister(handles[3].id());

        let ids = registry.ids();
        let expected: Vec<_> = handles
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 3)
            .map(|(_, h)| h.id())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = ConnectionRegistry::new();
        let a = make_handle();
        registry.register(a.clone()).unwrap();

        let snapshot = registry.snapshot();
        registry.unregister(a.id());
        registry.register(make_handle()).unwrap();

        assert_eq!(snapshot, vec![a]);
    }
}
