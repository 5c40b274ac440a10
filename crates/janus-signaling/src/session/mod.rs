//! Publisher-side handshake with a Janus videoroom.
//!
//! The sequence is create session, attach the videoroom plugin, join the
//! room as a publisher. It is driven entirely by transport callbacks; the
//! caller only starts it with [`JanusClient::connect`] and then sends its
//! offer and candidates once [`SessionListener::on_logged`] fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

mod keepalive;
mod state;

pub use state::{HandshakeState, Room};

use crate::config::ClientConfig;
use crate::error::{SignalingError, SignalingResult};
use crate::listener::SessionListener;
use crate::protocol::{
    self, Credentials, IgnoreReason, Inbound, Jsep, JsepType, MessageBody, ParticipantType,
    Request, ServerId, TrickleBody,
};
use crate::transaction::{
    CounterTransactions, PendingOp, PendingTransactions, Purpose, TransactionSource,
};
use crate::transport::{Connection, Transport, TransportHandler};
use keepalive::Keepalive;

/// How [`JanusClient::disconnect`] treats the transport task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Close and wait for the transport task to exit. Close callbacks,
    /// including `on_disconnected`, run before `disconnect` returns.
    Wait,
    /// Silence all callbacks, close, and let the transport task finish on
    /// its own.
    Detach,
}

pub struct JanusClient {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    ids: Arc<dyn TransactionSource>,
    active: Mutex<Option<ActiveLink>>,
}

struct ActiveLink {
    session: Arc<Session>,
    driver: JoinHandle<()>,
}

impl JanusClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            ids: Arc::new(CounterTransactions::new()),
            active: Mutex::new(None),
        }
    }

    /// Replaces the transaction token generator.
    pub fn with_transactions(mut self, ids: Arc<dyn TransactionSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Starts connecting to `url` and returns as soon as the transport task
    /// is running. Progress is reported through `listener`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        &self,
        url: &str,
        room: &str,
        username: &str,
        token: &str,
        listener: Arc<dyn SessionListener>,
    ) -> SignalingResult<()> {
        let runtime = Handle::try_current().map_err(|_| SignalingError::NoRuntime)?;
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SignalingError::AlreadyConnected);
        }
        let room: Room = room.parse()?;
        let connection = self.transport.connect(url)?;

        let session = Arc::new(Session {
            connection: Arc::clone(&connection),
            listener,
            config: Arc::clone(&self.config),
            ids: Arc::clone(&self.ids),
            room,
            username: username.to_string(),
            token: token.to_string(),
            state: Mutex::new(HandshakeState::Connecting),
            pending: Mutex::new(PendingTransactions::new()),
            keepalive: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let router: Arc<dyn TransportHandler> = Arc::new(EventRouter {
            session: Arc::downgrade(&session),
        });
        let driver = runtime.spawn(async move {
            connection.run(router).await;
        });
        tracing::debug!(url, room = session.room.id(), "signaling connect requested");

        *active = Some(ActiveLink { session, driver });
        Ok(())
    }

    /// Sends the local SDP offer. Only valid after `on_logged`.
    pub fn open(&self, sdp: &str) -> SignalingResult<()> {
        let session = self.active_session()?;
        let (session_id, handle_id) = session.joined_ids()?;
        session.send(&Request::Message {
            transaction: self.ids.next(Purpose::Configure),
            session_id: &session_id,
            handle_id: &handle_id,
            body: MessageBody::Configure {
                muted: false,
                video: true,
                audio: true,
            },
            jsep: Some(Jsep {
                kind: JsepType::Offer,
                sdp,
                trickle: true,
            }),
        })
    }

    /// Sends one local ICE candidate, or the end-of-candidates marker when
    /// `last` is set (the other arguments are then ignored).
    pub fn trickle(&self, mid: &str, index: u32, candidate: &str, last: bool) -> SignalingResult<()> {
        let session = self.active_session()?;
        let (session_id, handle_id) = session.joined_ids()?;
        session.send(&Request::Trickle {
            transaction: self.ids.next(Purpose::Trickle),
            session_id: &session_id,
            handle_id: &handle_id,
            candidate: TrickleBody::new(mid, index, candidate, last),
        })
    }

    /// Tears down the current connection, if any. Safe to call repeatedly.
    pub async fn disconnect(&self, teardown: Teardown) -> SignalingResult<()> {
        let link = self.active.lock().take();
        let Some(ActiveLink { session, driver }) = link else {
            return Ok(());
        };
        session.closing.store(true, Ordering::Release);
        if teardown == Teardown::Detach {
            session.muted.store(true, Ordering::Release);
        }

        let keepalive = session.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            keepalive.stop().await;
        }
        session.abort_timers();
        session.connection.close("disconnect");

        match teardown {
            Teardown::Wait => {
                if let Err(err) = driver.await {
                    if err.is_panic() {
                        tracing::warn!("signaling transport task panicked: {err}");
                    }
                }
            }
            Teardown::Detach => drop(driver),
        }

        session.pending.lock().clear();
        session.settle(HandshakeState::Closed);
        tracing::debug!(?teardown, "signaling disconnected");
        Ok(())
    }

    /// Snapshot of the handshake; `Idle` when nothing is connected.
    pub fn state(&self) -> HandshakeState {
        match self.active.lock().as_ref() {
            Some(link) => link.session.state.lock().clone(),
            None => HandshakeState::Idle,
        }
    }

    pub fn session_id(&self) -> Option<ServerId> {
        self.state().session_id().cloned()
    }

    fn active_session(&self) -> SignalingResult<Arc<Session>> {
        self.active
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.session))
            .ok_or(SignalingError::NotJoined)
    }
}

impl Drop for JanusClient {
    fn drop(&mut self) {
        if let Some(ActiveLink { session, driver }) = self.active.get_mut().take() {
            session.closing.store(true, Ordering::Release);
            session.muted.store(true, Ordering::Release);
            drop(session.keepalive.lock().take());
            session.abort_timers();
            session.connection.close("client dropped");
            drop(driver);
        }
    }
}

/// Transport callbacks for one connection.
///
/// Holds the session weakly and drops events once the session is muted or
/// gone, so a detached transport task can never reach the listener.
struct EventRouter {
    session: Weak<Session>,
}

impl EventRouter {
    fn live(&self) -> Option<Arc<Session>> {
        self.session
            .upgrade()
            .filter(|session| !session.muted.load(Ordering::Acquire))
    }
}

impl TransportHandler for EventRouter {
    fn on_open(&self) {
        if let Some(session) = self.live() {
            session.handle_open();
        }
    }

    fn on_message(&self, text: &str) {
        if let Some(session) = self.live() {
            session.handle_message(text);
        }
    }

    fn on_close(&self) {
        if let Some(session) = self.live() {
            session.handle_gone(HandshakeState::Closed);
        }
    }

    fn on_fail(&self, reason: &str) {
        if let Some(session) = self.live() {
            tracing::warn!(reason, "signaling transport failed");
            session.handle_gone(HandshakeState::Failed);
        }
    }
}

/// Everything one connection's handshake needs.
struct Session {
    connection: Arc<dyn Connection>,
    listener: Arc<dyn SessionListener>,
    config: Arc<ClientConfig>,
    ids: Arc<dyn TransactionSource>,
    room: Room,
    username: String,
    token: String,
    state: Mutex<HandshakeState>,
    pending: Mutex<PendingTransactions>,
    keepalive: Mutex<Option<Keepalive>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    muted: AtomicBool,
    /// Set by `disconnect` and drop before the keepalive slot is emptied.
    closing: AtomicBool,
}

impl Session {
    fn handle_open(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != HandshakeState::Connecting {
                return;
            }
            *state = HandshakeState::AwaitingSession;
        }
        self.listener.on_connected();

        let transaction = self.ids.next(Purpose::Create);
        self.expect_reply(&transaction, PendingOp::CreateSession);
        let request = Request::Create {
            transaction,
            payload: Credentials {
                username: &self.username,
                token: &self.token,
                room: self.room.as_str(),
            },
        };
        if let Err(err) = self.send(&request) {
            tracing::warn!("{err}");
        }
    }

    fn handle_message(self: &Arc<Self>, text: &str) {
        match protocol::classify(text) {
            Inbound::Answer { sdp } => {
                tracing::debug!(len = sdp.len(), "remote sdp answer received");
                self.listener.on_opened(&sdp);
            }
            Inbound::Success { transaction, id } => self.handle_success(&transaction, id),
            Inbound::Error {
                transaction,
                code,
                reason,
            } => self.handle_error(transaction.as_deref(), code, reason),
            Inbound::Ignored(IgnoreReason::NotJson) => {
                tracing::debug!(len = text.len(), "ignoring non-json frame");
            }
            Inbound::Ignored(reason) => tracing::trace!(?reason, "ignoring frame"),
        }
    }

    fn handle_success(self: &Arc<Self>, transaction: &str, id: ServerId) {
        let resolved = self.pending.lock().resolve(transaction);
        let Some(resolved) = resolved else {
            tracing::debug!(transaction, %id, "success for unknown or answered transaction");
            return;
        };
        tracing::debug!(
            op = %resolved.op,
            %id,
            elapsed_ms = resolved.elapsed.as_millis() as u64,
            "handshake reply"
        );
        match resolved.op {
            PendingOp::CreateSession => self.session_created(id),
            PendingOp::AttachPlugin => self.handle_attached(id),
        }
    }

    fn session_created(self: &Arc<Self>, session_id: ServerId) {
        {
            let mut state = self.state.lock();
            if *state != HandshakeState::AwaitingSession {
                return;
            }
            *state = HandshakeState::AwaitingHandle {
                session_id: session_id.clone(),
            };
        }

        let transaction = self.ids.next(Purpose::Attach);
        self.expect_reply(&transaction, PendingOp::AttachPlugin);
        let request = Request::Attach {
            transaction,
            session_id: &session_id,
            plugin: &self.config.plugin,
        };
        if let Err(err) = self.send(&request) {
            tracing::warn!(session = %session_id, "{err}");
        }

        // Checked under the slot lock so a concurrent teardown either finds
        // the task or keeps it from starting.
        let mut slot = self.keepalive.lock();
        if self.closing.load(Ordering::Acquire) || self.state.lock().is_terminal() {
            tracing::debug!(session = %session_id, "teardown in progress; keepalive not started");
            return;
        }
        let keepalive = Keepalive::spawn(
            Arc::clone(&self.connection),
            session_id,
            Arc::clone(&self.ids),
            self.config.keepalive_interval,
        );
        // Dropping a replaced task aborts it.
        drop(slot.replace(keepalive));
    }

    fn handle_attached(self: &Arc<Self>, handle_id: ServerId) {
        let session_id = {
            let mut state = self.state.lock();
            let HandshakeState::AwaitingHandle { session_id } = &*state else {
                return;
            };
            let session_id = session_id.clone();
            *state = HandshakeState::Joined {
                session_id: session_id.clone(),
                handle_id: handle_id.clone(),
            };
            session_id
        };

        let request = Request::Message {
            transaction: self.ids.next(Purpose::Join),
            session_id: &session_id,
            handle_id: &handle_id,
            body: MessageBody::Join {
                room: self.room.id(),
                display: &self.config.display_name,
                ptype: ParticipantType::Publisher,
            },
            jsep: None,
        };
        if let Err(err) = self.send(&request) {
            tracing::warn!(session = %session_id, handle = %handle_id, "{err}");
        }
        tracing::info!(
            session = %session_id,
            handle = %handle_id,
            room = self.room.id(),
            "joined videoroom"
        );
        self.listener.on_logged(&session_id);
    }

    fn handle_error(&self, transaction: Option<&str>, code: i64, reason: String) {
        let resolved = transaction.and_then(|transaction| self.pending.lock().resolve(transaction));
        match resolved {
            Some(resolved) => self.fail_handshake(SignalingError::Server {
                stage: resolved.op,
                code,
                reason,
            }),
            None => tracing::warn!(code, reason = %reason, "server reported an error"),
        }
    }

    fn handle_gone(&self, terminal: HandshakeState) {
        self.settle(terminal);
        self.pending.lock().clear();
        self.abort_timers();
        if let Some(keepalive) = self.keepalive.lock().as_ref() {
            keepalive.signal_stop();
        }
        self.listener.on_disconnected();
    }

    fn fail_handshake(&self, error: SignalingError) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = HandshakeState::Failed;
        }
        self.pending.lock().clear();
        tracing::warn!("signaling handshake failed: {error}");
        self.listener.on_error(&error);
        self.connection.close("handshake failed");
    }

    /// Records a handshake request and arms its reply deadline.
    fn expect_reply(self: &Arc<Self>, transaction: &str, op: PendingOp) {
        self.pending.lock().insert(transaction, op);

        let weak = Arc::downgrade(self);
        let transaction = transaction.to_string();
        let timeout = self.config.handshake_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                session.expire(&transaction, timeout);
            }
        });
        let mut timers = self.timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.push(timer);
    }

    fn expire(&self, transaction: &str, timeout: Duration) {
        if self.muted.load(Ordering::Acquire) {
            return;
        }
        let resolved = self.pending.lock().resolve(transaction);
        if let Some(resolved) = resolved {
            self.fail_handshake(SignalingError::HandshakeTimeout {
                stage: resolved.op,
                timeout,
            });
        }
    }

    fn abort_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }

    /// Moves to a terminal state unless one was already reached.
    fn settle(&self, terminal: HandshakeState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = terminal;
        }
    }

    fn joined_ids(&self) -> SignalingResult<(ServerId, ServerId)> {
        self.state
            .lock()
            .joined_ids()
            .map(|(session, handle)| (session.clone(), handle.clone()))
            .ok_or(SignalingError::NotJoined)
    }

    fn send(&self, request: &Request<'_>) -> SignalingResult<()> {
        let what = request.label();
        let text = request
            .encode()
            .map_err(|source| SignalingError::Encode { what, source })?;
        tracing::trace!(kind = what, transaction = request.transaction(), "sending request");
        self.connection
            .send(text)
            .map_err(|source| SignalingError::Send { what, source })
    }
}
