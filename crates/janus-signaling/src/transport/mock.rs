//! In-memory transport for tests and demos.
//!
//! Every connection created by [`MockTransport`] has a matching
//! [`MockRemote`] that plays the server: it fires the open/close/fail
//! events, delivers inbound frames and observes everything the client sends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use url::Url;

use super::{Connection, Transport, TransportHandler};
use crate::error::TransportError;

const IDLE: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug)]
enum MockEvent {
    Open,
    Message(String),
    Close,
    Fail(String),
}

#[derive(Default)]
pub struct MockTransport {
    remotes: Mutex<Vec<MockRemote>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remote end of the most recent connection.
    pub fn last_remote(&self) -> Option<MockRemote> {
        self.remotes.lock().last().cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.remotes.lock().len()
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|err| TransportError::Connect(format!("invalid url {url:?}: {err}")))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            url: parsed.to_string(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent_tx,
            sent_rx: AsyncMutex::new(sent_rx),
            state: AtomicU8::new(IDLE),
            fail_sends: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });
        self.remotes.lock().push(MockRemote {
            shared: Arc::clone(&shared),
        });
        Ok(Arc::new(MockConnection { shared }))
    }
}

struct MockShared {
    url: String,
    events_tx: mpsc::UnboundedSender<MockEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MockEvent>>>,
    sent_tx: mpsc::UnboundedSender<String>,
    sent_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    state: AtomicU8,
    fail_sends: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

/// Server side of a mock connection.
#[derive(Clone)]
pub struct MockRemote {
    shared: Arc<MockShared>,
}

impl MockRemote {
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn open(&self) {
        let _ = self.shared.events_tx.send(MockEvent::Open);
    }

    pub fn deliver(&self, text: impl Into<String>) {
        let _ = self.shared.events_tx.send(MockEvent::Message(text.into()));
    }

    pub fn deliver_json(&self, value: Value) {
        self.deliver(value.to_string());
    }

    /// Closes from the server side.
    pub fn close(&self) {
        let _ = self.shared.events_tx.send(MockEvent::Close);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.shared.events_tx.send(MockEvent::Fail(reason.into()));
    }

    /// Makes every following client send fail until turned off again.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == CLOSED
    }

    /// Reason passed to the client's `close` call, if it made one.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().clone()
    }

    /// Waits for the next frame the client sent, parsed as JSON.
    pub async fn next_frame(&self) -> Option<Value> {
        let text = self.shared.sent_rx.lock().await.recv().await?;
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    pub fn try_next_frame(&self) -> Option<Value> {
        let mut rx = self.shared.sent_rx.try_lock().ok()?;
        let text = rx.try_recv().ok()?;
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

struct MockConnection {
    shared: Arc<MockShared>,
}

#[async_trait]
impl Connection for MockConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocket("injected send failure".into()));
        }
        match self.shared.state.load(Ordering::SeqCst) {
            OPEN => self
                .shared
                .sent_tx
                .send(text)
                .map_err(|_| TransportError::Closed),
            CLOSED => Err(TransportError::Closed),
            _ => Err(TransportError::NotOpen),
        }
    }

    fn close(&self, reason: &str) {
        self.shared.close_reason.lock().get_or_insert_with(|| reason.to_string());
        let _ = self.shared.events_tx.send(MockEvent::Close);
    }

    async fn run(&self, handler: Arc<dyn TransportHandler>) {
        let Some(mut events) = self.shared.events_rx.lock().take() else {
            handler.on_fail("connection already started");
            return;
        };
        while let Some(event) = events.recv().await {
            match event {
                MockEvent::Open => {
                    if self.shared.state.load(Ordering::SeqCst) == IDLE {
                        self.shared.state.store(OPEN, Ordering::SeqCst);
                        handler.on_open();
                    }
                }
                MockEvent::Message(text) => {
                    if self.shared.state.load(Ordering::SeqCst) == OPEN {
                        handler.on_message(&text);
                    }
                }
                MockEvent::Close => {
                    let was_open = self.shared.state.swap(CLOSED, Ordering::SeqCst) == OPEN;
                    if was_open {
                        handler.on_close();
                    } else {
                        handler.on_fail("closed before the handshake completed");
                    }
                    return;
                }
                MockEvent::Fail(reason) => {
                    self.shared.state.store(CLOSED, Ordering::SeqCst);
                    handler.on_fail(&reason);
                    return;
                }
            }
        }
    }
}
