//! WebSocket transport server using Axum.
//!
//! Accepts upgrades on `/ws`, serves a `/health` check, and feeds every
//! connection's lifecycle into a `ServerFacade`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use wsbridge_core::{
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NO_STATUS, CloseInitiator, ConnectionId,
    ConnectionSink, Message,
};
use wsbridge_hub::ServerFacade;

use crate::channel::{ChannelSink, Outbound, on_blocking, write_loop};
use crate::error::TransportError;
use crate::tls::ensure_crypto_provider;

/// PEM certificate chain and private key for `wss://`.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Frames queued per connection before sends report `QueueFull`
    pub outbound_capacity: usize,
    /// Enable CORS
    pub enable_cors: bool,
    /// Log every frame at debug level
    pub verbose_logging: bool,
    /// Serve `wss://` when set
    pub tls: Option<TlsConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            max_connections: Some(32),
            outbound_capacity: 256,
            enable_cors: false,
            verbose_logging: false,
            tls: None,
        }
    }
}

struct AppState {
    facade: Arc<ServerFacade>,
    config: TransportConfig,
    /// One permit per connection slot; `None` when unlimited
    slots: Option<Arc<Semaphore>>,
}

enum Shutdown {
    Plain(mpsc::Sender<()>),
    Tls(axum_server::Handle),
}

/// A running server. Dropping it does not stop the listener; call `stop`.
pub struct TransportServer {
    facade: Arc<ServerFacade>,
    /// Shutdown signal
    shutdown: Option<Shutdown>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
    tls: bool,
}

impl TransportServer {
    /// Bind and start serving. Returns once the listener is bound.
    pub async fn start(
        config: TransportConfig,
        facade: Arc<ServerFacade>,
    ) -> Result<Self, TransportError> {
        let slots = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS))));
        let state = Arc::new(AppState {
            facade: facade.clone(),
            config: config.clone(),
            slots,
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }
        let service = app.into_make_service_with_connect_info::<SocketAddr>();

        let bind_to = format!("{}:{}", config.hostname, config.port);
        let addr: SocketAddr = bind_to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(bind_to.clone()))?;

        let (shutdown, handle, port) = match &config.tls {
            None => {
                let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                    error!(%addr, error = %e, "bind failed");
                    TransportError::Bind(e)
                })?;
                let port = listener.local_addr().map_err(TransportError::Bind)?.port();
                let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

                let handle = tokio::spawn(async move {
                    let served = axum::serve(listener, service)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.recv().await;
                        })
                        .await;
                    if let Err(e) = served {
                        error!(error = %e, "server exited with error");
                    }
                });
                (Shutdown::Plain(shutdown_tx), handle, port)
            }
            Some(tls) => {
                ensure_crypto_provider();
                let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .map_err(TransportError::Tls)?;
                let server_handle = axum_server::Handle::new();
                let task_handle = server_handle.clone();

                let handle = tokio::spawn(async move {
                    let served = axum_server::bind_rustls(addr, rustls)
                        .handle(task_handle)
                        .serve(service)
                        .await;
                    if let Err(e) = served {
                        error!(%addr, error = %e, "TLS server exited with error");
                    }
                });
                let bound = server_handle
                    .listening()
                    .await
                    .ok_or(TransportError::NotListening)?;
                (Shutdown::Tls(server_handle), handle, bound.port())
            }
        };

        let tls = config.tls.is_some();
        let scheme = if tls { "wss" } else { "ws" };
        info!("wsbridge listening on {scheme}://{}:{port}/ws", config.hostname);

        Ok(Self {
            facade,
            shutdown: Some(shutdown),
            handle: Some(handle),
            port,
            tls,
        })
    }

    pub fn facade(&self) -> &Arc<ServerFacade> {
        &self.facade
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Gracefully stop the server. Open connections are sent a going-away
    /// close first.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let report = self
            .facade
            .close_all_with(CLOSE_GOING_AWAY, "server shutting down");
        debug!(
            closed = report.delivered,
            failed = report.failures.len(),
            "closing connections for shutdown"
        );

        match shutdown {
            Shutdown::Plain(tx) => {
                let _ = tx.send(()).await;
            }
            Shutdown::Tls(handle) => handle.graceful_shutdown(Some(Duration::from_secs(5))),
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("wsbridge server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // The slot is taken before the upgrade and held until the connection
    // task returns, so concurrent handshakes cannot overshoot the limit.
    let permit = match &state.slots {
        Some(slots) => match slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let max = state.config.max_connections.unwrap_or_default();
                warn!(remote = %remote_addr, "connection rejected: max connections reached ({max})");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_ws_connection(socket, remote_addr, state, permit))
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.facade.connection_count(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

fn encode(frame: Outbound) -> WsMessage {
    match frame {
        Outbound::Text(text) => WsMessage::Text(text.into()),
        Outbound::Binary(data) => WsMessage::Binary(data),
        Outbound::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

async fn handle_ws_connection(
    socket: WebSocket,
    remote_addr: SocketAddr,
    state: Arc<AppState>,
    _slot: Option<OwnedSemaphorePermit>,
) {
    let conn_id = ConnectionId::new();
    let verbose = state.config.verbose_logging;
    let facade = state.facade.clone();

    let (ws_tx, mut ws_rx) = socket.split();
    let (sink, outbound_rx) = ChannelSink::new(state.config.outbound_capacity);
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, conn_id, encode));

    let opened = {
        let facade = facade.clone();
        let sink: Arc<dyn ConnectionSink> = sink.clone();
        on_blocking(move || facade.on_transport_open(conn_id, remote_addr, sink)).await
    };
    match opened {
        Some(Ok(_)) => {}
        Some(Err(e)) => {
            error!(conn_id = %conn_id, error = %e, "connection not registered, dropping socket");
            writer.abort();
            return;
        }
        None => {
            writer.abort();
            return;
        }
    }

    // A received close frame is remembered and the loop keeps polling once
    // more so the close reply gets flushed before the stream ends.
    let mut close_frame: Option<(u16, String)> = None;
    loop {
        let message = match ws_rx.next().await {
            Some(Ok(WsMessage::Text(text))) => Message::Text(text.as_str().to_owned()),
            Some(Ok(WsMessage::Binary(data))) => Message::Binary(data),
            Some(Ok(WsMessage::Close(frame))) => {
                if verbose {
                    debug!(conn_id = %conn_id, ?frame, "close frame received");
                }
                close_frame = Some(match frame {
                    Some(f) => (f.code, f.reason.as_str().to_owned()),
                    None => (CLOSE_NO_STATUS, String::new()),
                });
                continue;
            }
            Some(Ok(_)) => continue, // ping/pong handled by the protocol layer
            Some(Err(e)) => {
                if close_frame.is_none() {
                    let facade = facade.clone();
                    let description = e.to_string();
                    on_blocking(move || facade.on_transport_error(Some(conn_id), description)).await;
                }
                break;
            }
            None => break,
        };

        if close_frame.is_some() {
            continue;
        }
        if verbose {
            debug!(conn_id = %conn_id, bytes = message.len(), "frame received");
        }
        let facade = facade.clone();
        on_blocking(move || facade.on_transport_message(conn_id, message)).await;
    }

    let initiator = if sink.closed_locally() {
        CloseInitiator::Local
    } else {
        CloseInitiator::Remote
    };
    let (code, reason) = close_frame.unwrap_or((CLOSE_ABNORMAL, String::new()));
    on_blocking(move || facade.on_transport_close(conn_id, code, reason, initiator)).await;

    writer.abort();
}
