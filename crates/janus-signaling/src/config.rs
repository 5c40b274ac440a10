use std::env;
use std::time::Duration;

use crate::protocol::VIDEOROOM_PLUGIN;

pub const DEFAULT_SUBPROTOCOL: &str = "janus-protocol";

/// Tunables for a [`crate::JanusClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Period between keepalive frames once a session exists.
    pub keepalive_interval: Duration,
    /// How long a create or attach request may stay unanswered.
    pub handshake_timeout: Duration,
    /// Display name announced when joining the room.
    pub display_name: String,
    pub plugin: String,
    /// WebSocket subprotocol requested from the server, if any.
    pub subprotocol: Option<String>,
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let keepalive_interval = env::var("JANUS_KEEPALIVE_SECS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.keepalive_interval);
        let handshake_timeout = env::var("JANUS_HANDSHAKE_TIMEOUT_SECS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.handshake_timeout);
        let subprotocol = match env::var("JANUS_SUBPROTOCOL") {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => defaults.subprotocol,
        };

        Self {
            keepalive_interval,
            handshake_timeout,
            display_name: env::var("JANUS_DISPLAY_NAME").unwrap_or(defaults.display_name),
            plugin: env::var("JANUS_PLUGIN").unwrap_or(defaults.plugin),
            subprotocol,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            display_name: "OBS".to_string(),
            plugin: VIDEOROOM_PLUGIN.to_string(),
            subprotocol: Some(DEFAULT_SUBPROTOCOL.to_string()),
        }
    }
}
