use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

pub mod mock;
pub mod websocket;

pub use mock::{MockRemote, MockTransport};
pub use websocket::{TlsPolicy, WebSocketTransport};

/// Receiver of connection events.
///
/// A connection invokes these one at a time from its `run` future, never
/// concurrently with each other.
pub trait TransportHandler: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, text: &str);
    fn on_close(&self);
    fn on_fail(&self, reason: &str);
}

/// Factory for signaling connections.
pub trait Transport: Send + Sync {
    /// Builds a connection to `url` without touching the network.
    ///
    /// Fails when the URL cannot be used at all; handshake failures are
    /// reported later through [`TransportHandler::on_fail`].
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Queues a text frame for the peer.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Starts a normal close. Completion is reported through `on_close`.
    fn close(&self, reason: &str);

    /// Performs the handshake and drives I/O until the connection ends.
    ///
    /// Exactly one of `on_close` / `on_fail` is delivered before this
    /// returns.
    async fn run(&self, handler: Arc<dyn TransportHandler>);
}
