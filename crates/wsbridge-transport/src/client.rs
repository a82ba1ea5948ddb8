//! Outbound WebSocket connection driving a `ClientFacade`.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info};
use wsbridge_core::{
    BridgeError, CLOSE_ABNORMAL, CLOSE_NO_STATUS, CloseInitiator, ConnectionSink, Message,
};
use wsbridge_hub::ClientFacade;

use crate::channel::{ChannelSink, Outbound, on_blocking, write_loop};
use crate::error::TransportError;
use crate::tls::ensure_crypto_provider;

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// Frames queued before sends report `QueueFull`
    pub outbound_capacity: usize,
    /// Log every frame at debug level
    pub verbose_logging: bool,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound_capacity: 256,
            verbose_logging: false,
        }
    }
}

/// A live client connection. The facade stays usable after the connection
/// ends; `send_*` then fails with `SendFailed`.
pub struct TransportClient {
    facade: Arc<ClientFacade>,
    reader: Option<JoinHandle<()>>,
}

impl TransportClient {
    /// Connect and dispatch Opened. A failed handshake is reported to the
    /// facade's listeners as an Error event and returned.
    pub async fn connect(
        config: ClientConfig,
        facade: Arc<ClientFacade>,
    ) -> Result<Self, TransportError> {
        if config.url.starts_with("wss://") {
            ensure_crypto_provider();
        }

        let stream = match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                let description = e.to_string();
                let f = facade.clone();
                on_blocking(move || f.on_transport_error(description)).await;
                return Err(TransportError::Connect(e));
            }
        };
        let (ws_tx, ws_rx) = stream.split();
        let (sink, outbound_rx) = ChannelSink::new(config.outbound_capacity);

        let opened = {
            let f = facade.clone();
            let sink: Arc<dyn ConnectionSink> = sink.clone();
            on_blocking(move || f.on_transport_open(sink)).await
        };
        let conn_id = match opened {
            Some(Ok(id)) => id,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::CallbackPanicked),
        };
        info!(conn_id = %conn_id, url = %config.url, "client connected");

        let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, conn_id, encode));
        let reader = tokio::spawn(read_loop(
            ws_rx,
            writer,
            sink,
            facade.clone(),
            config.verbose_logging,
        ));

        Ok(Self {
            facade,
            reader: Some(reader),
        })
    }

    pub fn facade(&self) -> &Arc<ClientFacade> {
        &self.facade
    }

    /// Request a normal local close.
    pub fn close(&self) -> Result<(), BridgeError> {
        self.facade.close()
    }

    /// Resolve once the connection has ended and Closed was dispatched.
    ///
    /// Cancel-safe: dropping the returned future leaves the client waitable.
    pub async fn wait(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            let _ = reader.await;
            self.reader = None;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

fn encode(frame: Outbound) -> WsMessage {
    match frame {
        Outbound::Text(text) => WsMessage::Text(text.into()),
        Outbound::Binary(data) => WsMessage::Binary(data),
        Outbound::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

async fn read_loop<S>(
    mut ws_rx: S,
    writer: JoinHandle<()>,
    sink: Arc<ChannelSink>,
    facade: Arc<ClientFacade>,
    verbose: bool,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut close_frame: Option<(u16, String)> = None;
    while let Some(received) = ws_rx.next().await {
        let message = match received {
            Ok(WsMessage::Text(text)) => Message::Text(text.as_str().to_owned()),
            Ok(WsMessage::Binary(data)) => Message::Binary(data),
            Ok(WsMessage::Close(frame)) => {
                close_frame = Some(match frame {
                    Some(f) => (u16::from(f.code), f.reason.as_str().to_owned()),
                    None => (CLOSE_NO_STATUS, String::new()),
                });
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                if close_frame.is_none() {
                    let f = facade.clone();
                    let description = e.to_string();
                    on_blocking(move || f.on_transport_error(description)).await;
                }
                break;
            }
        };

        if close_frame.is_some() {
            continue;
        }
        if verbose {
            debug!(remote = %facade.remote(), bytes = message.len(), "frame received");
        }
        let f = facade.clone();
        on_blocking(move || f.on_transport_message(message)).await;
    }

    let initiator = if sink.closed_locally() {
        CloseInitiator::Local
    } else {
        CloseInitiator::Remote
    };
    let (code, reason) = close_frame.unwrap_or((CLOSE_ABNORMAL, String::new()));
    on_blocking(move || facade.on_transport_close(code, reason, initiator)).await;

    writer.abort();
}
