//! Hub tests: registry/dispatch properties exercised through the server facade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use wsbridge_core::*;
use wsbridge_hub::*;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Message>>,
    closes: Mutex<Vec<u16>>,
    fail: AtomicBool,
}

impl RecordingSink {
    fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Text(t) => Some(t.clone()),
                Message::Binary(_) => None,
            })
            .collect()
    }

    fn check(&self) -> std::result::Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(SinkError::Io("broken pipe".into()))
        } else {
            Ok(())
        }
    }
}

impl ConnectionSink for RecordingSink {
    fn send_text(&self, text: &str) -> std::result::Result<(), SinkError> {
        self.check()?;
        self.sent.lock().push(Message::Text(text.to_string()));
        Ok(())
    }

    fn send_binary(&self, data: Bytes) -> std::result::Result<(), SinkError> {
        self.check()?;
        self.sent.lock().push(Message::Binary(data));
        Ok(())
    }

    fn close(&self, code: u16, _reason: &str) -> std::result::Result<(), SinkError> {
        self.check()?;
        self.closes.lock().push(code);
        Ok(())
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn open(server: &ServerFacade, port: u16) -> (ConnectionId, Arc<RecordingSink>) {
    open_with(server, port, RecordingSink::default())
}

fn open_with(
    server: &ServerFacade,
    port: u16,
    sink: RecordingSink,
) -> (ConnectionId, Arc<RecordingSink>) {
    let sink = Arc::new(sink);
    let id = ConnectionId::new();
    server.on_transport_open(id, addr(port), sink.clone()).unwrap();
    (id, sink)
}

/// Listener that records (kind, connection id) for every event it sees.
fn record_events(server: &ServerFacade) -> Arc<Mutex<Vec<(EventKind, Option<ConnectionId>)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    server.subscribe(move |event: &Event| -> ListenerResult {
        sink.lock().push((event.kind(), event.connection_id()));
        Ok(())
    });
    log
}

// ─────────────────────────────────────────────────────────────────────────────
// Event ordering and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn events_arrive_in_transport_order() {
    let server = ServerFacade::new();
    let log = record_events(&server);
    let (id, _sink) = open(&server, 5001);

    server.on_transport_message(id, Message::from("one")).unwrap();
    server.on_transport_message(id, Message::from(vec![1u8])).unwrap();
    server.on_transport_error(Some(id), "hiccup");
    server.on_transport_message(id, Message::from("two")).unwrap();
    server
        .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();

    let kinds: Vec<_> = log.lock().iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Opened,
            EventKind::TextMessage,
            EventKind::BinaryMessage,
            EventKind::Error,
            EventKind::TextMessage,
            EventKind::Closed,
        ]
    );
    assert!(log.lock().iter().all(|(_, c)| *c == Some(id)));
}

#[test]
fn nothing_is_delivered_after_closed() {
    let server = ServerFacade::new();
    let log = record_events(&server);
    let (id, _sink) = open(&server, 5002);
    server
        .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();

    let late = server.on_transport_message(id, Message::from("late"));
    assert_eq!(late.unwrap_err(), BridgeError::ConnectionNotFound(id));
    assert!(
        server
            .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
            .is_err()
    );

    let kinds: Vec<_> = log.lock().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![EventKind::Opened, EventKind::Closed]);
}

#[test]
fn opened_summary_names_client_and_address() {
    let server = ServerFacade::new();
    let summaries = Arc::new(Mutex::new(Vec::new()));
    let sink = summaries.clone();
    server.subscribe(move |event: &Event| -> ListenerResult {
        if let Some(text) = event.text() {
            sink.lock().push(text.to_string());
        }
        Ok(())
    });

    let (a, _) = open(&server, 6001);
    let (b, _) = open(&server, 6002);
    server
        .on_transport_close(a, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();
    server
        .on_transport_close(b, CLOSE_NORMAL, "", CloseInitiator::Local)
        .unwrap();

    let summaries = summaries.lock();
    assert_eq!(summaries[0], format!("Client {a} at 127.0.0.1:6001 opened a connection"));
    assert_eq!(summaries[2], format!("Client {a} at 127.0.0.1:6001 closed the connection"));
    assert_eq!(summaries[3], format!("Closed connection to client {b} at 127.0.0.1:6002"));
}

#[test]
fn closed_event_carries_structured_detail() {
    let server = ServerFacade::new();
    let detail = Arc::new(Mutex::new(None));
    let sink = detail.clone();
    server.subscribe(move |event: &Event| -> ListenerResult {
        if let Some(d) = event.close_detail() {
            *sink.lock() = Some(d.clone());
        }
        Ok(())
    });

    let (id, _) = open(&server, 5003);
    server
        .on_transport_close(id, 4001, "policy", CloseInitiator::Local)
        .unwrap();

    assert_eq!(
        detail.lock().clone(),
        Some(CloseDetail::new(4001, "policy", CloseInitiator::Local))
    );
}

#[test]
fn listener_can_address_connection_during_its_close() {
    let server = Arc::new(ServerFacade::new());
    let found = Arc::new(AtomicBool::new(false));
    {
        let server_ref = Arc::downgrade(&server);
        let found = found.clone();
        server.subscribe(move |event: &Event| -> ListenerResult {
            if event.kind() == EventKind::Closed {
                let id = event.connection_id().ok_or("closed event without connection")?;
                if let Some(server) = server_ref.upgrade() {
                    found.store(server.lookup(id).is_ok(), Ordering::SeqCst);
                }
            }
            Ok(())
        });
    }

    let (id, _) = open(&server, 5004);
    server
        .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();

    assert!(found.load(Ordering::SeqCst));
    assert!(server.lookup(id).unwrap_err().is_not_found());
}

#[test]
fn duplicate_open_is_rejected_without_event() {
    let server = ServerFacade::new();
    let log = record_events(&server);
    let (id, _) = open(&server, 5005);

    let err = server
        .on_transport_open(id, addr(5006), Arc::new(RecordingSink::default()))
        .unwrap_err();
    assert_eq!(err, BridgeError::DuplicateIdentifier(id));
    assert_eq!(server.lookup(id).unwrap().remote_addr(), addr(5005));
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn server_level_error_has_no_connection() {
    let server = ServerFacade::new();
    let log = record_events(&server);
    server.on_transport_error(None, "accept failed");
    assert_eq!(log.lock().as_slice(), &[(EventKind::Error, None)]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Addressed and broadcast operations
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn addressed_ops_fail_after_close() {
    let server = ServerFacade::new();
    let (id, sink) = open(&server, 5010);
    server.send_to(id, "before").unwrap();
    server
        .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();

    assert_eq!(
        server.send_to(id, "after").unwrap_err(),
        BridgeError::ConnectionNotFound(id)
    );
    assert_eq!(
        server.close_one(id).unwrap_err(),
        BridgeError::ConnectionNotFound(id)
    );
    assert!(server.lookup(id).unwrap_err().is_not_found());
    assert_eq!(sink.texts(), vec!["before".to_string()]);
}

#[test]
fn send_to_rejected_by_transport_is_send_failed() {
    let server = ServerFacade::new();
    let (id, _) = open_with(&server, 5011, RecordingSink::failing());
    assert_eq!(
        server.send_to(id, "x").unwrap_err(),
        BridgeError::send_failed(id, SinkError::Io("broken pipe".into()))
    );
}

#[test]
fn broadcast_skips_failing_connection() {
    let server = ServerFacade::new();
    let healthy: Vec<_> = (0..4).map(|i| open(&server, 5100 + i).1).collect();
    let (bad_id, _) = open_with(&server, 5199, RecordingSink::failing());

    let report = server.send_to_all("fan-out");

    assert_eq!(report.attempted(), 5);
    assert_eq!(report.delivered, 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].connection_id(), Some(bad_id));
    for sink in &healthy {
        assert_eq!(sink.texts(), vec!["fan-out".to_string()]);
    }
}

#[test]
fn broadcast_scenario_two_clients() {
    let server = ServerFacade::new();
    let (a, sink_a) = open(&server, 5201);
    let (_b, sink_b) = open(&server, 5202);

    assert!(server.send_to_all("hello").is_complete());
    server
        .on_transport_close(a, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();
    assert!(server.send_to_all("world").is_complete());

    assert_eq!(sink_a.texts(), vec!["hello".to_string()]);
    assert_eq!(sink_b.texts(), vec!["hello".to_string(), "world".to_string()]);
    assert_eq!(
        server.lookup(a).unwrap_err(),
        BridgeError::ConnectionNotFound(a)
    );
}

#[test]
fn binary_broadcast_reaches_all() {
    let server = ServerFacade::new();
    let (_, a) = open(&server, 5301);
    let (_, b) = open(&server, 5302);
    server.send_to_all(Bytes::from_static(b"\x00\x01"));
    for sink in [&a, &b] {
        assert_eq!(
            sink.sent.lock().as_slice(),
            &[Message::Binary(Bytes::from_static(b"\x00\x01"))]
        );
    }
}

#[test]
fn close_one_and_close_all() {
    let server = ServerFacade::new();
    let (a, sink_a) = open(&server, 5401);
    let (_, sink_b) = open(&server, 5402);
    let (_, sink_c) = open_with(&server, 5403, RecordingSink::failing());

    server.close_one(a).unwrap();
    assert_eq!(server.lookup(a).unwrap().state(), ConnectionState::Closing);

    let report = server.close_all();
    // `a` is already closing, so its second close is a no-op success.
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0], BridgeError::CloseFailed { .. }));

    assert_eq!(sink_a.closes.lock().as_slice(), &[CLOSE_NORMAL]);
    assert_eq!(sink_b.closes.lock().as_slice(), &[CLOSE_NORMAL]);
    assert!(sink_c.closes.lock().is_empty());
    // Closing does not unregister; only the transport's close does.
    assert_eq!(server.connection_count(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener isolation and snapshot semantics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn failing_listener_keeps_receiving_and_others_unaffected() {
    let server = ServerFacade::new();
    let flaky_seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = flaky_seen.clone();
        server.subscribe(FnListener::new("flaky", move |event: &Event| -> ListenerResult {
            seen.lock().push(event.kind());
            if event.kind() == EventKind::TextMessage {
                return Err("cannot handle text".into());
            }
            Ok(())
        }));
    }
    let log = record_events(&server);

    let (id, _) = open(&server, 5501);
    let report = server.on_transport_message(id, Message::from("boom")).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failures.len(), 1);

    server.on_transport_message(id, Message::from(vec![7u8])).unwrap();
    server
        .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
        .unwrap();

    assert_eq!(
        flaky_seen.lock().as_slice(),
        &[
            EventKind::Opened,
            EventKind::TextMessage,
            EventKind::BinaryMessage,
            EventKind::Closed
        ]
    );
    assert_eq!(log.lock().len(), 4);
    assert_eq!(server.listeners().failure_count(), 1);
}

#[test]
fn subscribe_during_dispatch_applies_to_next_event() {
    let server = Arc::new(ServerFacade::new());
    let late_seen = Arc::new(Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&server);
        let late_seen = late_seen.clone();
        let added = AtomicBool::new(false);
        server.subscribe(move |_event: &Event| -> ListenerResult {
            if !added.swap(true, Ordering::SeqCst) {
                if let Some(server) = weak.upgrade() {
                    let seen = late_seen.clone();
                    server.subscribe(move |event: &Event| -> ListenerResult {
                        seen.lock().push(event.kind());
                        Ok(())
                    });
                }
            }
            Ok(())
        });
    }

    let (id, _) = open(&server, 5601);
    assert!(late_seen.lock().is_empty());

    server.on_transport_message(id, Message::from("next")).unwrap();
    assert_eq!(late_seen.lock().as_slice(), &[EventKind::TextMessage]);
}

#[test]
fn unsubscribe_during_dispatch_applies_to_next_event() {
    let server = Arc::new(ServerFacade::new());
    let victim_seen = Arc::new(Mutex::new(0usize));
    let victim_id = Arc::new(Mutex::new(None));

    {
        let weak = Arc::downgrade(&server);
        let victim_id = victim_id.clone();
        server.subscribe(move |_event: &Event| -> ListenerResult {
            if let (Some(server), Some(id)) = (weak.upgrade(), victim_id.lock().take()) {
                server.unsubscribe(id);
            }
            Ok(())
        });
    }
    {
        let seen = victim_seen.clone();
        let id = server.subscribe(move |_event: &Event| -> ListenerResult {
            *seen.lock() += 1;
            Ok(())
        });
        *victim_id.lock() = Some(id);
    }

    let (id, _) = open(&server, 5602);
    // Removed mid-dispatch, but the in-flight Opened event still reached it.
    assert_eq!(*victim_seen.lock(), 1);

    server.on_transport_message(id, Message::from("after")).unwrap();
    assert_eq!(*victim_seen.lock(), 1);
}

#[test]
fn listener_can_broadcast_from_inside_dispatch() {
    let server = Arc::new(ServerFacade::new());
    {
        let weak = Arc::downgrade(&server);
        server.subscribe(move |event: &Event| -> ListenerResult {
            if let (Some(server), Some(text)) = (weak.upgrade(), event.text()) {
                if event.kind() == EventKind::TextMessage {
                    server.send_to_all(format!("echo:{text}"));
                }
            }
            Ok(())
        });
    }

    let (a, sink_a) = open(&server, 5701);
    let (_, sink_b) = open(&server, 5702);
    server.on_transport_message(a, Message::from("hi")).unwrap();

    assert_eq!(sink_a.texts(), vec!["echo:hi".to_string()]);
    assert_eq!(sink_b.texts(), vec!["echo:hi".to_string()]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_opens_all_register() {
    let server = Arc::new(ServerFacade::new());
    let log = record_events(&server);

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let server = server.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        let id = ConnectionId::new();
                        server
                            .on_transport_open(
                                id,
                                addr(10_000 + t * 100 + i),
                                Arc::new(RecordingSink::default()),
                            )
                            .unwrap();
                        id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<ConnectionId> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 200);
    assert_eq!(server.connection_count(), 200);
    assert_eq!(log.lock().len(), 200);
}

#[test]
fn concurrent_lifecycles_keep_per_connection_order() {
    let server = Arc::new(ServerFacade::new());
    let log = record_events(&server);

    let workers: Vec<_> = (0..6u16)
        .map(|t| {
            let server = server.clone();
            thread::spawn(move || {
                let id = ConnectionId::new();
                server
                    .on_transport_open(id, addr(20_000 + t), Arc::new(RecordingSink::default()))
                    .unwrap();
                for i in 0..50 {
                    server.on_transport_message(id, Message::from(format!("{i}"))).unwrap();
                    server.send_to_all("tick");
                }
                server
                    .on_transport_close(id, CLOSE_NORMAL, "", CloseInitiator::Remote)
                    .unwrap();
                id
            })
        })
        .collect();
    let ids: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let log = log.lock();
    for id in ids {
        let kinds: Vec<_> = log
            .iter()
            .filter(|(_, c)| *c == Some(id))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(kinds.len(), 52);
        assert_eq!(kinds.first(), Some(&EventKind::Opened));
        assert_eq!(kinds.last(), Some(&EventKind::Closed));
        assert!(kinds[1..51].iter().all(|k| *k == EventKind::TextMessage));
    }
    assert_eq!(server.connection_count(), 0);
}
