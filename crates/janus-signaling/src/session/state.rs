use std::str::FromStr;

use crate::error::SignalingError;
use crate::protocol::ServerId;

/// Where the handshake currently stands.
///
/// Replies only move the machine forward from the one state that expects
/// them, so a late or repeated reply has nothing to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Connecting,
    AwaitingSession,
    AwaitingHandle {
        session_id: ServerId,
    },
    Joined {
        session_id: ServerId,
        handle_id: ServerId,
    },
    Closed,
    Failed,
}

impl HandshakeState {
    pub fn session_id(&self) -> Option<&ServerId> {
        match self {
            HandshakeState::AwaitingHandle { session_id }
            | HandshakeState::Joined { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn joined_ids(&self) -> Option<(&ServerId, &ServerId)> {
        match self {
            HandshakeState::Joined {
                session_id,
                handle_id,
            } => Some((session_id, handle_id)),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Closed | HandshakeState::Failed)
    }
}

/// Numeric videoroom id, kept alongside the text the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    raw: String,
    id: u64,
}

impl Room {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl FromStr for Room {
    type Err = SignalingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let id = raw.parse::<u64>().map_err(|source| SignalingError::InvalidRoom {
            room: raw.to_string(),
            source,
        })?;
        Ok(Room {
            raw: raw.to_string(),
            id,
        })
    }
}
