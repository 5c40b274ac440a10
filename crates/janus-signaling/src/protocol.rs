//! Wire messages exchanged with the media server.
//!
//! Outbound requests are typed and serialized with serde; every request is
//! tagged by the `janus` field. Inbound frames are parsed loosely and then
//! classified, since the server mixes replies, events and acks on the same
//! socket and only a handful of shapes matter to the handshake.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Server-assigned session or handle id.
///
/// Real servers hand out unsigned integers, but the value is opaque to the
/// client and is echoed back in whatever JSON form it arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerId {
    Number(u64),
    Text(String),
}

impl ServerId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(ServerId::Number),
            Value::String(s) => Some(ServerId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerId::Number(n) => write!(f, "{n}"),
            ServerId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ServerId {
    fn from(value: u64) -> Self {
        ServerId::Number(value)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        ServerId::Text(value.to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "janus", rename_all = "snake_case")]
pub enum Request<'a> {
    Create {
        transaction: String,
        payload: Credentials<'a>,
    },
    Attach {
        transaction: String,
        session_id: &'a ServerId,
        plugin: &'a str,
    },
    Message {
        transaction: String,
        session_id: &'a ServerId,
        handle_id: &'a ServerId,
        body: MessageBody<'a>,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep<'a>>,
    },
    Trickle {
        transaction: String,
        session_id: &'a ServerId,
        handle_id: &'a ServerId,
        candidate: TrickleBody<'a>,
    },
    Keepalive {
        transaction: String,
        session_id: &'a ServerId,
    },
}

impl Request<'_> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn transaction(&self) -> &str {
        match self {
            Request::Create { transaction, .. }
            | Request::Attach { transaction, .. }
            | Request::Message { transaction, .. }
            | Request::Trickle { transaction, .. }
            | Request::Keepalive { transaction, .. } => transaction,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Attach { .. } => "attach",
            Request::Message {
                body: MessageBody::Join { .. },
                ..
            } => "join",
            Request::Message {
                body: MessageBody::Configure { .. },
                ..
            } => "configure",
            Request::Trickle { .. } => "trickle",
            Request::Keepalive { .. } => "keepalive",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub token: &'a str,
    pub room: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum MessageBody<'a> {
    Join {
        room: u64,
        display: &'a str,
        ptype: ParticipantType,
    },
    Configure {
        muted: bool,
        video: bool,
        audio: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    Publisher,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsepType {
    Offer,
}

#[derive(Debug, Serialize)]
pub struct Jsep<'a> {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: &'a str,
    pub trickle: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TrickleBody<'a> {
    Candidate {
        #[serde(rename = "sdpMid")]
        sdp_mid: &'a str,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u32,
        candidate: &'a str,
    },
    Completed {
        completed: bool,
    },
}

impl<'a> TrickleBody<'a> {
    /// A final call replaces the candidate with the end-of-candidates marker.
    pub fn new(mid: &'a str, index: u32, candidate: &'a str, last: bool) -> Self {
        if last {
            TrickleBody::Completed { completed: true }
        } else {
            TrickleBody::Candidate {
                sdp_mid: mid,
                sdp_mline_index: index,
                candidate,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotJson,
    NoKind,
    Ack,
    MissingFields,
    Unhandled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Any frame carrying a remote session description.
    Answer { sdp: String },
    Success {
        transaction: String,
        id: ServerId,
    },
    Error {
        transaction: Option<String>,
        code: i64,
        reason: String,
    },
    Ignored(IgnoreReason),
}

/// Classifies an inbound text frame.
///
/// The `jsep` check runs before the kind is looked at: answers arrive inside
/// plugin `event` frames and must be delivered regardless of the envelope.
pub fn classify(text: &str) -> Inbound {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return Inbound::Ignored(IgnoreReason::NotJson);
    };
    let Some(kind) = msg.get("janus").and_then(Value::as_str) else {
        return Inbound::Ignored(IgnoreReason::NoKind);
    };
    if kind == "ack" {
        return Inbound::Ignored(IgnoreReason::Ack);
    }
    if let Some(jsep) = msg.get("jsep") {
        return match jsep.get("sdp").and_then(Value::as_str) {
            Some(sdp) => Inbound::Answer {
                sdp: sdp.to_string(),
            },
            None => Inbound::Ignored(IgnoreReason::MissingFields),
        };
    }

    let transaction = msg
        .get("transaction")
        .and_then(Value::as_str)
        .map(str::to_string);
    match kind {
        "success" => {
            let id = msg
                .get("data")
                .and_then(|data| data.get("id"))
                .and_then(ServerId::from_value);
            match (transaction, id) {
                (Some(transaction), Some(id)) => Inbound::Success { transaction, id },
                _ => Inbound::Ignored(IgnoreReason::MissingFields),
            }
        }
        "error" => {
            let error = msg.get("error");
            Inbound::Error {
                transaction,
                code: error
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_i64)
                    .unwrap_or_default(),
                reason: error
                    .and_then(|e| e.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }
        }
        _ => Inbound::Ignored(IgnoreReason::Unhandled),
    }
}
