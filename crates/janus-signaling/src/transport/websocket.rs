use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use url::Url;

use super::{Connection, Transport, TransportHandler};
use crate::config::{ClientConfig, DEFAULT_SUBPROTOCOL};
use crate::error::TransportError;

const CLOSE_GRACE: Duration = Duration::from_secs(3);

const IDLE: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Certificate handling for `wss://` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// TLS 1.2 or newer with full certificate validation.
    #[default]
    Modern,
    /// TLS 1.2 or newer, accepting any certificate. Local testing only.
    AcceptInvalidCerts,
}

/// WebSocket transport built on tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    subprotocol: Option<String>,
    tls: TlsPolicy,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            subprotocol: Some(DEFAULT_SUBPROTOCOL.to_string()),
            tls: TlsPolicy::default(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new().with_subprotocol(config.subprotocol.clone())
    }

    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    pub fn with_tls_policy(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|err| TransportError::Connect(format!("invalid url {url:?}: {err}")))?;
        let secure = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported scheme {other:?}; expected ws or wss"
                )));
            }
        };

        let mut request = parsed
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        if let Some(subprotocol) = &self.subprotocol {
            let value = HeaderValue::from_str(subprotocol)
                .map_err(|err| TransportError::Connect(format!("invalid subprotocol: {err}")))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(WebSocketConnection {
            url: parsed,
            request: Mutex::new(Some(request)),
            tls: secure.then_some(self.tls),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state: AtomicU8::new(IDLE),
        }))
    }
}

/// Builds the TLS context used for `wss://` connections.
pub fn tls_connector(policy: TlsPolicy) -> Result<native_tls::TlsConnector, TransportError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    if policy == TlsPolicy::AcceptInvalidCerts {
        builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|err| TransportError::Tls(err.to_string()))
}

enum Outbound {
    Text(String),
    Close(String),
}

struct WebSocketConnection {
    url: Url,
    request: Mutex<Option<Request>>,
    tls: Option<TlsPolicy>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    state: AtomicU8,
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        match self.state.load(Ordering::Acquire) {
            OPEN => self
                .outbound_tx
                .send(Outbound::Text(text))
                .map_err(|_| TransportError::Closed),
            CLOSED => Err(TransportError::Closed),
            _ => Err(TransportError::NotOpen),
        }
    }

    fn close(&self, reason: &str) {
        let _ = self.outbound_tx.send(Outbound::Close(reason.to_string()));
    }

    async fn run(&self, handler: Arc<dyn TransportHandler>) {
        let request = self.request.lock().take();
        let outbound_rx = self.outbound_rx.lock().take();
        let (Some(request), Some(mut outbound_rx)) = (request, outbound_rx) else {
            handler.on_fail("connection already started");
            return;
        };

        let connector = match self.tls.map(tls_connector).transpose() {
            Ok(tls) => tls.map(Connector::NativeTls),
            Err(err) => {
                self.state.store(CLOSED, Ordering::Release);
                handler.on_fail(&err.to_string());
                return;
            }
        };

        let handshake = connect_async_tls_with_config(request, None, false, connector);
        let ws_stream = tokio::select! {
            result = handshake => match result {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!(url = %self.url, "signaling websocket connect failed: {err}");
                    self.state.store(CLOSED, Ordering::Release);
                    handler.on_fail(&err.to_string());
                    return;
                }
            },
            // Only a close request can be queued before the socket is open.
            _ = outbound_rx.recv() => {
                self.state.store(CLOSED, Ordering::Release);
                handler.on_fail("closed before the handshake completed");
                return;
            }
        };
        tracing::debug!(url = %self.url, "signaling websocket connected");

        self.state.store(OPEN, Ordering::Release);
        handler.on_open();

        let (mut ws_write, mut ws_read) = ws_stream.split();
        loop {
            tokio::select! {
                command = outbound_rx.recv() => match command {
                    Some(Outbound::Text(text)) => {
                        tracing::trace!(event = "ws_out", len = text.len());
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            tracing::warn!("signaling websocket write failed: {err}");
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        self.state.store(CLOSED, Ordering::Release);
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        };
                        if ws_write.send(Message::Close(Some(frame))).await.is_ok() {
                            // Wait briefly for the peer to answer the close.
                            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                                while let Some(Ok(_)) = ws_read.next().await {}
                            })
                            .await;
                        }
                        break;
                    }
                    None => break,
                },
                incoming = ws_read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(event = "ws_in", kind = "text", len = text.len());
                        handler.on_message(&text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::trace!(event = "ws_in", kind = "binary", len = data.len());
                        if let Ok(text) = String::from_utf8(data) {
                            handler.on_message(&text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!("signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        tracing::debug!(url = %self.url, "signaling websocket finished");
        handler.on_close();
    }
}
