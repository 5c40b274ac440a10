mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use janus_signaling::transport::{
    Connection, MockRemote, MockTransport, Transport, TransportHandler,
};
use janus_signaling::{
    ClientConfig, CounterTransactions, HandshakeState, JanusClient, ServerId, SignalingError,
    Teardown, TransportError,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout};

use support::{Event, RecordingListener, assert_no_event, next_event};

const URL: &str = "ws://janus.test:8188/";

fn client(transport: &Arc<MockTransport>) -> JanusClient {
    JanusClient::new(transport.clone(), ClientConfig::default())
        .with_transactions(Arc::new(CounterTransactions::with_prefix("t")))
}

async fn next_frame(remote: &MockRemote) -> Value {
    timeout(Duration::from_secs(5), remote.next_frame())
        .await
        .expect("outbound frame timed out")
        .expect("outbound channel closed")
}

/// Next frame that is not a keepalive.
async fn next_request(remote: &MockRemote) -> Value {
    loop {
        let frame = next_frame(remote).await;
        if frame["janus"] != "keepalive" {
            return frame;
        }
    }
}

fn drain(remote: &MockRemote) -> Vec<Value> {
    std::iter::from_fn(|| remote.try_next_frame()).collect()
}

fn count_kind(frames: &[Value], kind: &str) -> usize {
    frames.iter().filter(|frame| frame["janus"] == kind).count()
}

struct Joined {
    transport: Arc<MockTransport>,
    client: JanusClient,
    remote: MockRemote,
    events: mpsc::UnboundedReceiver<Event>,
}

/// Runs the full handshake with session `S1` and handle `H1`.
async fn joined() -> Joined {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");

    remote.open();
    assert_eq!(next_event(&mut events).await, Event::Connected);
    let create = next_request(&remote).await;
    remote.deliver_json(json!({
        "janus": "success",
        "transaction": create["transaction"],
        "data": {"id": "S1"}
    }));
    let attach = next_request(&remote).await;
    remote.deliver_json(json!({
        "janus": "success",
        "transaction": attach["transaction"],
        "data": {"id": "H1"}
    }));
    let join = next_request(&remote).await;
    assert_eq!(join["body"]["request"], "join");
    assert_eq!(next_event(&mut events).await, Event::Logged(ServerId::from("S1")));

    Joined {
        transport,
        client,
        remote,
        events,
    }
}

#[tokio::test(start_paused = true)]
async fn handshake_sends_create_attach_join_in_order() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    assert_eq!(client.state(), HandshakeState::Connecting);

    let remote = transport.last_remote().expect("connection created");
    assert_eq!(remote.url(), URL);
    remote.open();
    assert_eq!(next_event(&mut events).await, Event::Connected);

    assert_eq!(
        next_frame(&remote).await,
        json!({
            "janus": "create",
            "transaction": "t-1",
            "payload": {"username": "alice", "token": "t1", "room": "42"}
        })
    );
    assert_eq!(client.state(), HandshakeState::AwaitingSession);

    remote.deliver_json(json!({"janus": "success", "transaction": "t-1", "data": {"id": "S1"}}));
    assert_eq!(
        next_frame(&remote).await,
        json!({
            "janus": "attach",
            "transaction": "t-2",
            "session_id": "S1",
            "plugin": "janus.plugin.videoroom"
        })
    );
    assert_eq!(client.session_id(), Some(ServerId::from("S1")));

    remote.deliver_json(json!({"janus": "success", "transaction": "t-2", "data": {"id": "H1"}}));
    let join = next_request(&remote).await;
    assert_eq!(join["janus"], "message");
    assert_eq!(join["session_id"], "S1");
    assert_eq!(join["handle_id"], "H1");
    assert_eq!(
        join["body"],
        json!({"request": "join", "room": 42, "display": "OBS", "ptype": "publisher"})
    );
    assert!(join["body"]["room"].is_u64());

    assert_eq!(next_event(&mut events).await, Event::Logged(ServerId::from("S1")));
    assert_eq!(
        client.state(),
        HandshakeState::Joined {
            session_id: ServerId::from("S1"),
            handle_id: ServerId::from("H1"),
        }
    );

    client.disconnect(Teardown::Wait).await.expect("disconnect");
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn numeric_ids_are_echoed_as_numbers() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "1234", "bob", "secret", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");
    remote.open();

    let create = next_request(&remote).await;
    remote.deliver_json(json!({"janus": "success", "transaction": create["transaction"], "data": {"id": 8_812_337_441u64}}));
    let attach = next_request(&remote).await;
    assert_eq!(attach["session_id"], json!(8_812_337_441u64));
    remote.deliver_json(json!({"janus": "success", "transaction": attach["transaction"], "data": {"id": 5u64}}));
    let join = next_request(&remote).await;
    assert_eq!(join["handle_id"], json!(5));
    assert_eq!(join["body"]["room"], json!(1234));

    assert_eq!(next_event(&mut events).await, Event::Connected);
    assert_eq!(next_event(&mut events).await, Event::Logged(ServerId::Number(8_812_337_441)));
}

#[tokio::test(start_paused = true)]
async fn duplicate_session_success_is_dropped() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");
    remote.open();
    let _ = next_request(&remote).await;

    let success = json!({"janus": "success", "transaction": "t-1", "data": {"id": "S1"}});
    remote.deliver_json(success.clone());
    remote.deliver_json(success);

    sleep(Duration::from_millis(6_500)).await;
    let frames = drain(&remote);
    assert_eq!(count_kind(&frames, "attach"), 1);
    assert_eq!(count_kind(&frames, "message"), 0);
    // One scheduler: a frame at 0s, 2s, 4s and 6s.
    assert_eq!(count_kind(&frames, "keepalive"), 4);

    assert_eq!(next_event(&mut events).await, Event::Connected);
    assert_no_event(&mut events, Duration::from_secs(1)).await;
    assert_eq!(
        client.state(),
        HandshakeState::AwaitingHandle {
            session_id: ServerId::from("S1")
        }
    );
}

#[tokio::test(start_paused = true)]
async fn stray_and_repeated_successes_change_nothing() {
    let Joined {
        client,
        remote,
        mut events,
        ..
    } = joined().await;

    remote.deliver_json(json!({"janus": "success", "transaction": "t-2", "data": {"id": "H2"}}));
    remote.deliver_json(json!({"janus": "success", "transaction": "never-sent", "data": {"id": "X"}}));
    remote.deliver_json(json!({"janus": "success", "data": {"id": "X"}}));
    remote.deliver(r#"{"janus":"ack","transaction":"t-3"}"#);
    remote.deliver("garbage");

    assert_no_event(&mut events, Duration::from_secs(1)).await;
    let frames = drain(&remote);
    assert_eq!(frames.len(), count_kind(&frames, "keepalive"));
    assert_eq!(
        client.state(),
        HandshakeState::Joined {
            session_id: ServerId::from("S1"),
            handle_id: ServerId::from("H1"),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn open_sends_configure_with_the_offer_verbatim() {
    let Joined {
        client,
        remote,
        mut events,
        ..
    } = joined().await;

    let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\na=msid-semantic: WMS ☃\r\n";
    client.open(sdp).expect("open");

    let configure = next_request(&remote).await;
    assert_eq!(configure["janus"], "message");
    assert_eq!(configure["session_id"], "S1");
    assert_eq!(configure["handle_id"], "H1");
    assert_eq!(
        configure["body"],
        json!({"request": "configure", "muted": false, "video": true, "audio": true})
    );
    assert_eq!(configure["jsep"]["type"], "offer");
    assert_eq!(configure["jsep"]["sdp"].as_str(), Some(sdp));
    assert_eq!(configure["jsep"]["trickle"], true);

    remote.deliver_json(json!({
        "janus": "event",
        "session_id": "S1",
        "sender": "H1",
        "plugindata": {"plugin": "janus.plugin.videoroom", "data": {"configured": "ok"}},
        "jsep": {"type": "answer", "sdp": "v=0\r\nanswer\r\n"}
    }));
    assert_eq!(next_event(&mut events).await, Event::Opened("v=0\r\nanswer\r\n".into()));
}

#[tokio::test(start_paused = true)]
async fn trickle_sends_candidate_then_completion() {
    let Joined { client, remote, .. } = joined().await;

    client
        .trickle("0", 3, "candidate:1 1 UDP 2122260223 192.0.2.1 54400 typ host", false)
        .expect("trickle candidate");
    let candidate = next_request(&remote).await;
    assert_eq!(candidate["janus"], "trickle");
    assert_eq!(candidate["session_id"], "S1");
    assert_eq!(candidate["handle_id"], "H1");
    assert!(candidate["transaction"].as_str().unwrap().starts_with("trickle-"));
    assert_eq!(
        candidate["candidate"],
        json!({
            "sdpMid": "0",
            "sdpMLineIndex": 3,
            "candidate": "candidate:1 1 UDP 2122260223 192.0.2.1 54400 typ host"
        })
    );

    client
        .trickle("0", 3, "candidate:ignored", true)
        .expect("trickle completion");
    let completed = next_request(&remote).await;
    assert_eq!(completed["candidate"], json!({"completed": true}));
}

#[tokio::test(start_paused = true)]
async fn open_and_trickle_require_a_joined_handle() {
    let transport = MockTransport::new();
    let client = client(&transport);
    assert!(matches!(client.open("v=0"), Err(SignalingError::NotJoined)));

    let (listener, _events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");
    remote.open();
    let _ = next_request(&remote).await;

    assert!(matches!(client.open("v=0"), Err(SignalingError::NotJoined)));
    assert!(matches!(
        client.trickle("0", 0, "candidate:1", false),
        Err(SignalingError::NotJoined)
    ));
    sleep(Duration::from_millis(100)).await;
    assert!(drain(&remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_failures_surface_from_open() {
    let Joined { client, remote, .. } = joined().await;

    remote.fail_sends(true);
    let err = client.open("v=0").expect_err("send must fail");
    assert!(matches!(err, SignalingError::Send { what: "configure", .. }));
    let err = client.trickle("0", 0, "", true).expect_err("send must fail");
    assert!(matches!(err, SignalingError::Send { what: "trickle", .. }));

    remote.fail_sends(false);
    client.open("v=0").expect("open after recovery");
}

#[tokio::test(start_paused = true)]
async fn keepalive_runs_every_interval_until_disconnect() {
    let Joined {
        client,
        remote,
        mut events,
        ..
    } = joined().await;
    drain(&remote);

    let mut last = Instant::now();
    for _ in 0..4 {
        let frame = next_frame(&remote).await;
        assert_eq!(frame["janus"], "keepalive");
        assert_eq!(frame["session_id"], "S1");
        let now = Instant::now();
        assert!(now - last <= Duration::from_millis(2_050), "gap {:?}", now - last);
        last = now;
    }

    client.disconnect(Teardown::Wait).await.expect("disconnect");
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
    drain(&remote);

    sleep(Duration::from_secs(10)).await;
    assert!(drain(&remote).is_empty());
    assert_eq!(remote.close_reason().as_deref(), Some("disconnect"));
}

#[tokio::test(start_paused = true)]
async fn keepalive_keeps_trying_after_send_failures() {
    let Joined { client, remote, .. } = joined().await;

    remote.fail_sends(true);
    sleep(Duration::from_secs(5)).await;
    drain(&remote);
    remote.fail_sends(false);

    let frame = next_frame(&remote).await;
    assert_eq!(frame["janus"], "keepalive");
    assert!(matches!(client.state(), HandshakeState::Joined { .. }));
}

#[tokio::test(start_paused = true)]
async fn detached_teardown_silences_callbacks() {
    let Joined {
        client,
        remote,
        mut events,
        ..
    } = joined().await;

    client.disconnect(Teardown::Detach).await.expect("disconnect");
    assert_no_event(&mut events, Duration::from_secs(1)).await;
    assert!(remote.is_closed());
    assert_eq!(client.state(), HandshakeState::Idle);

    drain(&remote);
    sleep(Duration::from_secs(6)).await;
    assert!(drain(&remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_close_ends_the_session() {
    let Joined {
        client,
        remote,
        mut events,
        ..
    } = joined().await;

    remote.close();
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
    assert_eq!(client.state(), HandshakeState::Closed);
    assert!(matches!(client.open("v=0"), Err(SignalingError::NotJoined)));

    client.disconnect(Teardown::Wait).await.expect("disconnect");
    assert_no_event(&mut events, Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn transport_failure_reports_disconnect() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    transport
        .last_remote()
        .expect("connection created")
        .fail("connection refused");

    assert_eq!(next_event(&mut events).await, Event::Disconnected);
    assert_eq!(client.state(), HandshakeState::Failed);
}

#[tokio::test(start_paused = true)]
async fn unanswered_create_times_out() {
    let transport = MockTransport::new();
    let config = ClientConfig {
        handshake_timeout: Duration::from_secs(3),
        ..ClientConfig::default()
    };
    let client = JanusClient::new(transport.clone(), config);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");
    remote.open();
    assert_eq!(next_event(&mut events).await, Event::Connected);

    let started = Instant::now();
    match next_event(&mut events).await {
        Event::Error(message) => assert!(message.contains("create session"), "{message}"),
        other => panic!("expected timeout error, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
    assert_eq!(client.state(), HandshakeState::Failed);
    assert_eq!(remote.close_reason().as_deref(), Some("handshake failed"));
}

#[tokio::test(start_paused = true)]
async fn server_error_fails_the_handshake() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, mut events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = transport.last_remote().expect("connection created");
    remote.open();
    assert_eq!(next_event(&mut events).await, Event::Connected);
    let create = next_request(&remote).await;

    remote.deliver_json(json!({
        "janus": "error",
        "transaction": create["transaction"],
        "error": {"code": 403, "reason": "Unauthorized request (wrong or missing secret/token)"}
    }));
    match next_event(&mut events).await {
        Event::Error(message) => {
            assert!(message.contains("403"), "{message}");
            assert!(message.contains("create session"), "{message}");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, Event::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn connect_rejects_bad_input_and_stays_reusable() {
    let transport = MockTransport::new();
    let client = client(&transport);

    let (listener, _events) = RecordingListener::new();
    let err = client
        .connect(URL, "lobby", "alice", "t1", listener.clone())
        .expect_err("room must be numeric");
    assert!(matches!(err, SignalingError::InvalidRoom { ref room, .. } if room == "lobby"));
    assert_eq!(transport.connection_count(), 0);

    let err = client
        .connect("not a url", "42", "alice", "t1", listener.clone())
        .expect_err("url must parse");
    assert!(matches!(err, SignalingError::Transport(TransportError::Connect(_))));

    client
        .connect(URL, "42", "alice", "t1", listener.clone())
        .expect("connect after errors");
    let err = client
        .connect(URL, "42", "alice", "t1", listener.clone())
        .expect_err("second connect");
    assert!(matches!(err, SignalingError::AlreadyConnected));
    assert_eq!(transport.connection_count(), 1);

    client.disconnect(Teardown::Wait).await.expect("disconnect");
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("reconnect after disconnect");
    assert_eq!(transport.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_connection_is_a_no_op() {
    let transport = MockTransport::new();
    let client = client(&transport);
    client.disconnect(Teardown::Wait).await.expect("first");
    client.disconnect(Teardown::Detach).await.expect("second");
    assert_eq!(client.state(), HandshakeState::Idle);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_client_closes_the_connection() {
    let Joined {
        transport,
        client,
        remote,
        mut events,
    } = joined().await;

    drop(client);
    assert_no_event(&mut events, Duration::from_secs(1)).await;
    assert!(remote.is_closed());
    assert_eq!(remote.close_reason().as_deref(), Some("client dropped"));
    assert_eq!(transport.connection_count(), 1);
}

#[test]
fn connect_outside_a_runtime_is_rejected() {
    let transport = MockTransport::new();
    let client = client(&transport);
    let (listener, _events) = RecordingListener::new();
    let err = client
        .connect(URL, "42", "alice", "t1", listener)
        .expect_err("no runtime");
    assert!(matches!(err, SignalingError::NoRuntime));
}

/// Holds the attach frame inside `send` until the test lets it through.
struct AttachGate {
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
    /// Keepalive sends attempted, successful or not.
    keepalives: AtomicUsize,
}

struct GatedTransport {
    inner: Arc<MockTransport>,
    gate: Arc<AttachGate>,
}

impl Transport for GatedTransport {
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(GatedConnection {
            inner: self.inner.connect(url)?,
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct GatedConnection {
    inner: Arc<dyn Connection>,
    gate: Arc<AttachGate>,
}

#[async_trait]
impl Connection for GatedConnection {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if text.contains(r#""janus":"keepalive""#) {
            self.gate.keepalives.fetch_add(1, Ordering::SeqCst);
        }
        if text.contains(r#""janus":"attach""#) {
            if let Some(entered) = self.gate.entered.lock().take() {
                let _ = entered.send(());
                let _ = self.gate.release.lock().recv();
            }
        }
        self.inner.send(text)
    }

    fn close(&self, reason: &str) {
        self.inner.close(reason);
    }

    async fn run(&self, handler: Arc<dyn TransportHandler>) {
        self.inner.run(handler).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detach_during_session_setup_leaves_no_keepalive_behind() {
    let mock = MockTransport::new();
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let gate = Arc::new(AttachGate {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
        keepalives: AtomicUsize::new(0),
    });
    let transport = Arc::new(GatedTransport {
        inner: mock.clone(),
        gate: Arc::clone(&gate),
    });
    let config = ClientConfig {
        keepalive_interval: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let client = JanusClient::new(transport, config)
        .with_transactions(Arc::new(CounterTransactions::with_prefix("t")));
    let (listener, _events) = RecordingListener::new();
    client
        .connect(URL, "42", "alice", "t1", listener)
        .expect("connect");
    let remote = mock.last_remote().expect("connection created");
    remote.open();
    let _ = next_request(&remote).await;
    remote.deliver_json(json!({"janus": "success", "transaction": "t-1", "data": {"id": "S1"}}));

    timeout(Duration::from_secs(5), entered_rx)
        .await
        .expect("attach send reached")
        .expect("gate dropped");
    client.disconnect(Teardown::Detach).await.expect("disconnect");
    release_tx.send(()).expect("release attach");

    sleep(Duration::from_millis(300)).await;
    drop(client);
    sleep(Duration::from_millis(500)).await;

    let frames = drain(&remote);
    assert_eq!(count_kind(&frames, "keepalive"), 0, "{frames:?}");
    assert_eq!(gate.keepalives.load(Ordering::SeqCst), 0);
}
