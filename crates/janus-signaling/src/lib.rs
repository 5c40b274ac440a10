//! Client side of the Janus videoroom signaling handshake.
//!
//! [`JanusClient`] drives create session, attach plugin and join room over
//! a [`transport::Transport`], keeps the session alive in the background,
//! and carries the publisher's SDP offer and trickle candidates once the
//! room is joined. Media itself is out of scope: SDP and candidates are
//! opaque strings supplied by the caller's media engine.

pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transaction;
pub mod transport;

pub use config::ClientConfig;
pub use error::{SignalingError, SignalingResult, TransportError};
pub use listener::SessionListener;
pub use protocol::ServerId;
pub use session::{HandshakeState, JanusClient, Room, Teardown};
pub use transaction::{CounterTransactions, PendingOp, Purpose, TransactionSource};
