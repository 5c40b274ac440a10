use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{Request, ServerId};
use crate::transaction::{Purpose, TransactionSource};
use crate::transport::Connection;

/// Background task that keeps a server session from idling out.
pub(crate) struct Keepalive {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Keepalive {
    /// Sends the first keepalive right away, then one per `interval`.
    pub(crate) fn spawn(
        connection: Arc<dyn Connection>,
        session_id: ServerId,
        ids: Arc<dyn TransactionSource>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            connection,
            session_id,
            ids,
            interval,
            Arc::clone(&stop),
            Arc::clone(&wake),
        ));
        Self {
            stop,
            wake,
            task: Some(task),
        }
    }

    /// Asks the task to exit without waiting for it.
    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) async fn stop(mut self) {
        self.signal_stop();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(err) = task.await {
            if err.is_panic() {
                tracing::warn!("keepalive task panicked: {err}");
            }
        }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    connection: Arc<dyn Connection>,
    session_id: ServerId,
    ids: Arc<dyn TransactionSource>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let request = Request::Keepalive {
            transaction: ids.next(Purpose::Keepalive),
            session_id: &session_id,
        };
        let sent = request
            .encode()
            .map_err(|err| err.to_string())
            .and_then(|text| connection.send(text).map_err(|err| err.to_string()));
        match sent {
            Ok(()) => tracing::trace!(session = %session_id, "keepalive sent"),
            // Not fatal; the loop runs until stopped.
            Err(err) => tracing::warn!(session = %session_id, "keepalive send failed: {err}"),
        }
    }
    tracing::debug!(session = %session_id, "keepalive stopped");
}
