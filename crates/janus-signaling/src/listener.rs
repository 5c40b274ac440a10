use crate::error::SignalingError;
use crate::protocol::ServerId;

/// Lifecycle notifications for the owner of a [`crate::JanusClient`].
///
/// Callbacks run on the transport task. They must return quickly and must
/// not call [`crate::JanusClient::disconnect`] with [`crate::Teardown::Wait`]
/// from inside, since that waits for the very task invoking them.
pub trait SessionListener: Send + Sync {
    /// WebSocket handshake finished; no signaling has happened yet.
    fn on_connected(&self);

    /// The server delivered a remote SDP answer.
    fn on_opened(&self, sdp: &str);

    /// Session created, handle attached and the join request sent.
    fn on_logged(&self, session_id: &ServerId);

    /// The transport closed or failed. Terminal for the session.
    fn on_disconnected(&self);

    fn on_error(&self, _error: &SignalingError) {}
}
