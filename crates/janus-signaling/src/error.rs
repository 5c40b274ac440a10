use std::num::ParseIntError;
use std::time::Duration;

use thiserror::Error;

use crate::transaction::PendingOp;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not create connection: {0}")]
    Connect(String),
    #[error("connection is not open")]
    NotOpen,
    #[error("connection closed")]
    Closed,
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("client is already connected; disconnect first")]
    AlreadyConnected,
    #[error("room {room:?} is not a numeric room id")]
    InvalidRoom {
        room: String,
        #[source]
        source: ParseIntError,
    },
    #[error("no plugin handle attached yet; wait for on_logged")]
    NotJoined,
    #[error("connect must be called from within a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to send {what}: {source}")]
    Send {
        what: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("no reply to {stage} within {timeout:?}")]
    HandshakeTimeout { stage: PendingOp, timeout: Duration },
    #[error("server rejected {stage}: {reason} (code {code})")]
    Server {
        stage: PendingOp,
        code: i64,
        reason: String,
    },
}

pub type SignalingResult<T> = Result<T, SignalingError>;
