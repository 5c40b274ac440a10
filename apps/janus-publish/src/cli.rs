use std::path::PathBuf;

use clap::Parser;
use janus_signaling::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "janus-publish",
    about = "Join a Janus videoroom as a publisher and exchange SDP over WebSocket"
)]
pub struct Cli {
    /// Gateway WebSocket URL, e.g. ws://localhost:8188/
    #[arg(long, env = "JANUS_URL")]
    pub url: String,

    /// Numeric videoroom id.
    #[arg(long, env = "JANUS_ROOM")]
    pub room: String,

    #[arg(long, env = "JANUS_USERNAME")]
    pub username: String,

    #[arg(long, env = "JANUS_TOKEN", hide_env_values = true)]
    pub token: String,

    /// SDP offer to publish once the room is joined.
    #[arg(long, value_name = "FILE")]
    pub offer: Option<PathBuf>,

    /// Local ICE candidate as MID:INDEX:CANDIDATE. Repeatable.
    #[arg(long = "candidate", value_name = "MID:INDEX:CANDIDATE", value_parser = parse_candidate)]
    pub candidates: Vec<LocalCandidate>,

    /// Disconnect after the remote answer has been printed.
    #[arg(long)]
    pub exit_on_answer: bool,

    /// Accept self-signed certificates on wss:// URLs.
    #[arg(long)]
    pub insecure: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub mid: String,
    pub index: u32,
    pub candidate: String,
}

fn parse_candidate(raw: &str) -> Result<LocalCandidate, String> {
    // The candidate line itself contains colons, so split at most twice.
    let mut parts = raw.splitn(3, ':');
    let (Some(mid), Some(index), Some(candidate)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected MID:INDEX:CANDIDATE, got {raw:?}"));
    };
    let index = index
        .parse::<u32>()
        .map_err(|err| format!("invalid m-line index {index:?}: {err}"))?;
    Ok(LocalCandidate {
        mid: mid.to_string(),
        index,
        candidate: candidate.to_string(),
    })
}
