mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use janus_signaling::logging::{self, LogConfig};
use janus_signaling::transport::{TlsPolicy, WebSocketTransport};
use janus_signaling::{
    ClientConfig, JanusClient, ServerId, SessionListener, SignalingError, Teardown,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cli::{Cli, LocalCandidate};

/// Listener events forwarded to the main task.
#[derive(Debug)]
enum Lifecycle {
    Connected,
    Logged(ServerId),
    Answer(String),
    Failed(String),
    Disconnected,
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<Lifecycle>,
}

impl SessionListener for ChannelListener {
    fn on_connected(&self) {
        let _ = self.tx.send(Lifecycle::Connected);
    }

    fn on_opened(&self, sdp: &str) {
        let _ = self.tx.send(Lifecycle::Answer(sdp.to_string()));
    }

    fn on_logged(&self, session_id: &ServerId) {
        let _ = self.tx.send(Lifecycle::Logged(session_id.clone()));
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(Lifecycle::Disconnected);
    }

    fn on_error(&self, error: &SignalingError) {
        let _ = self.tx.send(Lifecycle::Failed(error.to_string()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let offer = match &cli.offer {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read offer from {}", path.display()))?,
        ),
        None => None,
    };

    let config = ClientConfig::from_env();
    let tls = if cli.insecure {
        TlsPolicy::AcceptInvalidCerts
    } else {
        TlsPolicy::Modern
    };
    let transport = WebSocketTransport::from_config(&config).with_tls_policy(tls);
    let client = JanusClient::new(Arc::new(transport), config);

    let (tx, mut events) = mpsc::unbounded_channel();
    client
        .connect(
            &cli.url,
            &cli.room,
            &cli.username,
            &cli.token,
            Arc::new(ChannelListener { tx }),
        )
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    info!(url = %cli.url, room = %cli.room, "connecting");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    Lifecycle::Connected => info!("websocket open; creating session"),
                    Lifecycle::Logged(session_id) => {
                        info!(session = %session_id, "joined room");
                        if let Some(offer) = offer.as_deref() {
                            publish(&client, offer, &cli.candidates)?;
                        }
                    }
                    Lifecycle::Answer(sdp) => {
                        println!("{sdp}");
                        if cli.exit_on_answer {
                            client.disconnect(Teardown::Wait).await?;
                            break;
                        }
                    }
                    Lifecycle::Failed(reason) => error!("signaling error: {reason}"),
                    Lifecycle::Disconnected => {
                        warn!("signaling connection closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; disconnecting");
                client.disconnect(Teardown::Wait).await?;
                break;
            }
        }
    }

    client.disconnect(Teardown::Detach).await?;
    Ok(())
}

fn publish(client: &JanusClient, offer: &str, candidates: &[LocalCandidate]) -> Result<()> {
    client.open(offer).context("failed to send offer")?;
    for candidate in candidates {
        client
            .trickle(&candidate.mid, candidate.index, &candidate.candidate, false)
            .context("failed to send candidate")?;
    }
    client
        .trickle("", 0, "", true)
        .context("failed to send end of candidates")?;
    info!(candidates = candidates.len(), "offer and candidates sent");
    Ok(())
}
