//! Listener set and event fan-out.
//!
//! Listeners run in subscription order. Membership is copy-on-write: a
//! dispatch clones the current member list under a short read lock and then
//! calls listeners with no lock held, so a listener may subscribe,
//! unsubscribe, or send through the facade without deadlocking, and a
//! concurrent membership change never affects an event already in flight.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};
use wsbridge_core::{BridgeError, Event};

pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Observer of bridge events.
///
/// One method for all five event kinds; branch on `event.kind()`.
pub trait Listener: Send + Sync {
    fn handle(&self, event: &Event) -> ListenerResult;

    /// Name used in failure logs.
    fn name(&self) -> &str {
        "listener"
    }
}

impl<F> Listener for F
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn handle(&self, event: &Event) -> ListenerResult {
        self(event)
    }
}

/// A closure listener with a name.
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn handle(&self, event: &Event) -> ListenerResult {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn Listener>,
}

/// One listener's failure during a dispatch.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub id: ListenerId,
    pub error: BridgeError,
}

/// Outcome of delivering one event.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<ListenerFailure>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

pub struct ListenerSet {
    entries: RwLock<Arc<Vec<ListenerEntry>>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
        }
    }

    pub fn subscribe<L: Listener + 'static>(&self, listener: L) -> ListenerId {
        self.subscribe_arc(Arc::new(listener))
    }

    /// Subscribe a shared listener. The same `Arc` may be subscribed more
    /// than once; each subscription gets its own id and its own delivery.
    pub fn subscribe_arc(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(ListenerEntry { id, listener });
        *entries = Arc::new(next);
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<ListenerEntry> = entries.iter().filter(|e| e.id != id).cloned().collect();
        *entries = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total listener failures since creation.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every listener subscribed at call time.
    ///
    /// A listener that errors or panics is logged and skipped; delivery
    /// continues with the next one.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let snapshot = self.entries.read().clone();
        let mut report = DispatchReport::default();

        for entry in snapshot.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.listener.handle(event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            let name = entry.listener.name();
            warn!(
                listener = name,
                kind = %event.kind(),
                conn_id = ?event.connection_id(),
                error = %message,
                "listener failed"
            );
            self.failures.fetch_add(1, Ordering::Relaxed);
            report.failures.push(ListenerFailure {
                id: entry.id,
                error: BridgeError::listener_failure(name, message),
            });
        }

        debug!(
            kind = %event.kind(),
            listeners = snapshot.len(),
            failed = report.failures.len(),
            "dispatched event"
        );
        report
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
