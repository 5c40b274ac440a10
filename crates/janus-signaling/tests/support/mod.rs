#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use janus_signaling::{ServerId, SessionListener, SignalingError};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout, timeout_at};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Opened(String),
    Logged(ServerId),
    Disconnected,
    Error(String),
}

pub struct RecordingListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionListener for RecordingListener {
    fn on_connected(&self) {
        let _ = self.tx.send(Event::Connected);
    }

    fn on_opened(&self, sdp: &str) {
        let _ = self.tx.send(Event::Opened(sdp.to_string()));
    }

    fn on_logged(&self, session_id: &ServerId) {
        let _ = self.tx.send(Event::Logged(session_id.clone()));
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn on_error(&self, error: &SignalingError) {
        let _ = self.tx.send(Event::Error(error.to_string()));
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("listener event timed out")
        .expect("listener channel closed")
}

/// Waits out the full window, even when every sender is already gone.
pub async fn assert_no_event(events: &mut mpsc::UnboundedReceiver<Event>, wait: Duration) {
    let deadline = Instant::now() + wait;
    if let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
        panic!("unexpected listener event: {event:?}");
    }
    sleep_until(deadline).await;
}
