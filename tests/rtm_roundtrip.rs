// Drives a client against an in-process fake RTM server: handshake over
// HTTP, then a JSON frame socket.
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use rtm_client::config::{AuthType, Config, Options};
use rtm_client::peer::{MediaHandle, PeerConfig, PeerConnection, PeerConnector, PeerEvents, Role};
use rtm_client::wsproto::Envelope;
use rtm_client::{ConnectionState, Event, PeerEventKind, RtmClient, RtmError};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Notify};

#[derive(Default)]
struct FakeServer {
    // Non-zero makes the handshake fail with that status.
    status: AtomicU16,
    answer_pings: AtomicBool,
    pong_auth: Mutex<Option<String>>,
    pong_ts: Mutex<Option<i64>>,
    // Hands out a socket URL whose upgrade never completes.
    stall_socket: AtomicBool,
    // Drops the current socket without a close frame.
    kill: Notify,
    handshakes: AtomicUsize,
    authorization: Mutex<Vec<Option<String>>>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl FakeServer {
    fn push(&self, frame: Value) {
        let current = self.current.lock().unwrap();
        let tx = current.as_ref().expect("no socket connected");
        tx.send(Message::Text(frame.to_string())).unwrap();
    }

    fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

struct Harness {
    server: Arc<FakeServer>,
    inbox: mpsc::UnboundedReceiver<Value>,
    base: String,
}

impl Harness {
    async fn start() -> Self {
        let server = Arc::new(FakeServer::default());
        server.answer_pings.store(true, Ordering::SeqCst);
        let (tx, inbox) = mpsc::unbounded_channel();
        *server.inbox.lock().unwrap() = Some(tx);

        let app = Router::new()
            .route("/api/v1/rtm.connect", post(rtm_connect))
            .route("/ws", get(ws_upgrade))
            .route("/stall", get(stall))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Harness {
            server,
            inbox,
            base: format!("http://{addr}"),
        }
    }

    fn config(&self) -> Config {
        Config::new(&self.base).unwrap().with_options(fast_options())
    }

    /// Next frame of type `kind` the client sent; other frames are skipped.
    async fn next_frame(&mut self, kind: &str) -> Value {
        let fut = async {
            loop {
                let frame = self.inbox.recv().await.expect("server gone");
                if frame["type"] == kind {
                    return frame;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .unwrap_or_else(|_| panic!("no {kind} frame received"))
    }
}

async fn rtm_connect(State(server): State<Arc<FakeServer>>, headers: HeaderMap) -> Response {
    server.handshakes.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    server.authorization.lock().unwrap().push(auth);

    let status = server.status.load(Ordering::SeqCst);
    if status != 0 {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, "nope").into_response();
    }
    let url = if server.stall_socket.load(Ordering::SeqCst) {
        "/stall"
    } else {
        "/ws"
    };
    Json(json!({"ok": true, "url": url})).into_response()
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(server): State<Arc<FakeServer>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, server))
}

async fn stall() -> StatusCode {
    std::future::pending().await
}

async fn serve_socket(socket: WebSocket, server: Arc<FakeServer>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *server.current.lock().unwrap() = Some(tx.clone());
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });
    let _ = tx.send(Message::Text(json!({"type": "hello"}).to_string()));

    loop {
        let msg = tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
            _ = server.kill.notified() => {
                // Both halves go away, so the TCP stream closes without a
                // close frame.
                writer.abort();
                return;
            }
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let mut frame: Value = serde_json::from_str(&text).unwrap();
        if frame["type"] == "ping" && server.answer_pings.load(Ordering::SeqCst) {
            frame["type"] = json!("pong");
            if let Some(auth) = server.pong_auth.lock().unwrap().clone() {
                frame["auth"] = json!(auth);
            }
            if let Some(ts) = *server.pong_ts.lock().unwrap() {
                frame["ts"] = json!(ts);
            }
            let _ = tx.send(Message::Text(frame.to_string()));
            continue;
        }
        if let Some(inbox) = server.inbox.lock().unwrap().as_ref() {
            let _ = inbox.send(frame);
        }
    }
}

fn fast_options() -> Options {
    Options {
        connect_timeout_ms: 2000,
        heartbeat_interval_ms: 200,
        reconnect_interval_ms: 50,
        max_reconnect_interval_ms: 200,
        reconnect_spreader_ms: 0,
        call_reply_timeout_ms: 2000,
        ..Options::default()
    }
}

async fn eventually(client: &RtmClient, what: &str, pred: impl Fn(&ConnectionState) -> bool) {
    let fut = async {
        loop {
            if pred(&client.state().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn next_event(rx: &mut broadcast::Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("event not observed")
}

#[derive(Default, Clone)]
struct RecordingConnector {
    created: Arc<Mutex<Vec<Role>>>,
}

struct NullPeer;

impl PeerConnection for NullPeer {
    fn signal(&mut self, _data: Value) {}
    fn destroy(&mut self) {}
}

impl PeerConnector for RecordingConnector {
    fn create(
        &self,
        role: Role,
        _local: Option<MediaHandle>,
        _config: &PeerConfig,
        _events: PeerEvents,
    ) -> Box<dyn PeerConnection> {
        self.created.lock().unwrap().push(role);
        Box::new(NullPeer)
    }
}

fn client_for(cfg: Config) -> RtmClient {
    RtmClient::new(cfg, Arc::new(RecordingConnector::default())).unwrap()
}

#[tokio::test]
async fn connect_and_correlate_replies() {
    let mut h = Harness::start().await;
    let client = client_for(h.config());
    client.connect("alice").await.unwrap();
    let state = client.state().await.unwrap();
    assert!(state.connected);
    assert!(!state.connecting);
    assert_eq!(state.reconnect_attempts, 0);

    let request = Envelope::new("echo", &json!({"n": 1})).unwrap();
    let (reply, ()) = tokio::join!(
        client.send_websocket_payload(request, Duration::from_secs(2)),
        async {
            let frame = h.next_frame("echo").await;
            let id = frame["id"].as_u64().unwrap();
            assert!(id > 0);
            // Nobody waits for this one.
            h.server
                .push(json!({"type": "echo", "reply_to": id + 1000, "n": 0}));
            h.server.push(json!({"type": "echo", "reply_to": id, "n": 1}));
        }
    );
    let reply = reply.unwrap().expect("reply expected");
    assert_eq!(reply.body["n"], json!(1));

    let fire = Envelope::new("note", &json!({})).unwrap();
    assert!(client
        .send_websocket_payload(fire, Duration::ZERO)
        .await
        .unwrap()
        .is_none());
    h.next_frame("note").await;

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let h = Harness::start().await;
    let client = client_for(h.config());
    client.connect("alice").await.unwrap();

    let request = Envelope::new("echo", &json!({})).unwrap();
    let err = client
        .send_websocket_payload(request, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RtmError::Timeout));
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn send_without_socket_fails() {
    let h = Harness::start().await;
    let client = client_for(h.config());
    let request = Envelope::new("echo", &json!({})).unwrap();
    let err = client
        .send_websocket_payload(request, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, RtmError::NoConnection));
}

#[tokio::test]
async fn forbidden_handshake_stops_reconnecting() {
    let h = Harness::start().await;
    h.server.status.store(403, Ordering::SeqCst);
    let client = client_for(h.config());
    let mut events = client.subscribe();

    let err = client.connect("mallory").await.unwrap_err();
    assert!(err.is_fatal(), "unexpected {err:?}");

    let event = next_event(&mut events, |e| matches!(e, Event::Error(_))).await;
    match event {
        Event::Error(err) => assert_eq!(err.code, "http_error_403"),
        other => panic!("unexpected {other:?}"),
    }
    let state = client.state().await.unwrap();
    assert!(!state.reconnecting);
    assert!(!state.connected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.server.handshakes(), 1);
}

#[tokio::test]
async fn failing_handshake_retries_until_server_recovers() {
    let h = Harness::start().await;
    h.server.status.store(500, Ordering::SeqCst);
    let client = client_for(h.config());

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("alice").await })
    };
    eventually(&client, "retries", |s| s.reconnect_attempts >= 2).await;
    assert!(h.server.handshakes() >= 2);

    h.server.status.store(0, Ordering::SeqCst);
    waiter.await.unwrap().unwrap();
    let state = client.state().await.unwrap();
    assert!(state.connected);
    assert_eq!(state.reconnect_attempts, 0);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn destroy_rejects_pending_connect() {
    let h = Harness::start().await;
    h.server.status.store(500, Ordering::SeqCst);
    let client = client_for(h.config());

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("alice").await })
    };
    eventually(&client, "first failure", |s| s.reconnect_attempts >= 1).await;
    client.destroy().await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, RtmError::Shutdown));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = h.server.handshakes();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.server.handshakes(), seen);
}

#[tokio::test]
async fn pong_refreshes_auth_for_next_handshake() {
    let mut h = Harness::start().await;
    *h.server.pong_auth.lock().unwrap() = Some("second".into());
    let client = client_for(h.config().with_auth(AuthType::Bearer, "first"));

    client.connect("alice").await.unwrap();
    eventually(&client, "refreshed token", |s| {
        s.auth_token.as_deref() == Some("second")
    })
    .await;

    h.server.push(json!({"type": "goodbye"}));
    eventually(&client, "second handshake", |_| h.server.handshakes() >= 2).await;
    eventually(&client, "reconnected", |s| s.connected).await;

    let auth = h.server.authorization.lock().unwrap().clone();
    assert_eq!(auth[0].as_deref(), Some("Bearer first"));
    assert_eq!(auth[1].as_deref(), Some("Bearer second"));

    // The new socket still carries frames.
    let fire = Envelope::new("note", &json!({})).unwrap();
    client
        .send_websocket_payload(fire, Duration::ZERO)
        .await
        .unwrap();
    h.next_frame("note").await;
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn goodbye_goes_through_backoff() {
    let h = Harness::start().await;
    let client = client_for(h.config());
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    h.server.push(json!({"type": "goodbye"}));
    let dropped = next_event(&mut events, |e| {
        matches!(e, Event::StateChanged(s) if !s.connected && !s.connecting)
    })
    .await;
    match dropped {
        Event::StateChanged(s) => {
            assert!(s.reconnecting);
            assert_eq!(s.reconnect_attempts, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    next_event(&mut events, |e| matches!(e, Event::StateChanged(s) if s.connected)).await;
    assert_eq!(h.server.handshakes(), 2);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn missing_pongs_force_reconnect() {
    let h = Harness::start().await;
    h.server.answer_pings.store(false, Ordering::SeqCst);
    let client = client_for(h.config());
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    next_event(&mut events, |e| {
        matches!(e, Event::StateChanged(s) if !s.connected && !s.connecting && s.reconnecting)
    })
    .await;
    eventually(&client, "reconnect", |s| s.connected).await;
    assert!(h.server.handshakes() >= 2);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn outgoing_call_round_trip() {
    let mut h = Harness::start().await;
    let connector = RecordingConnector::default();
    let created = connector.created.clone();
    let client = RtmClient::new(h.config(), Arc::new(connector)).unwrap();
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    let (channel, offer) = tokio::join!(client.do_call("bob"), async {
        let offer = h.next_frame("webrtc").await;
        let id = offer["id"].as_u64().unwrap();
        h.server.push(json!({
            "type": "webrtc",
            "reply_to": id,
            "subtype": "webrtc_channel",
            "channel": "ch-1",
            "hash": "h1",
        }));
        offer
    });
    assert_eq!(channel.unwrap(), "ch-1");
    assert_eq!(offer["subtype"], "webrtc_call");
    assert_eq!(offer["target"], "bob");
    assert_eq!(offer["initiator"], true);
    let nonce = offer["state"].as_str().unwrap().to_string();
    assert_eq!(nonce.len(), 12);

    h.server.push(json!({
        "type": "webrtc",
        "subtype": "webrtc_call",
        "source": "bob",
        "target": "alice",
        "state": "bobstate",
        "channel": "ch-1",
        "hash": "h1",
        "data": {"accept": true, "state": nonce},
    }));
    let accepted = next_event(&mut events, |e| {
        matches!(e, Event::Peer(p) if p.kind == PeerEventKind::OutgoingCall)
    })
    .await;
    match accepted {
        Event::Peer(p) => {
            assert_eq!(p.channel, "ch-1");
            assert_eq!(p.record.user, "bob");
            assert_eq!(p.record.reference, "bobstate");
            assert_eq!(p.record.hash, "h1");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(created.lock().unwrap().as_slice(), [Role::Initiator]);

    let err = client.do_call("carol").await.unwrap_err();
    assert!(matches!(err, RtmError::ChannelActive));

    let previous = client.do_hangup(None, None).await.unwrap();
    assert_eq!(previous.as_deref(), Some("ch-1"));
    let hangup = h.next_frame("webrtc").await;
    assert_eq!(hangup["subtype"], "webrtc_hangup");
    assert_eq!(hangup["channel"], "ch-1");
    assert_eq!(hangup["data"]["reason"], "hangup");
    assert_eq!(hangup["data"]["state"], "bobstate");

    client.destroy().await.unwrap();
}

#[tokio::test]
async fn bogus_pong_timestamp_is_ignored() {
    let mut h = Harness::start().await;
    *h.server.pong_ts.lock().unwrap() = Some(i64::MIN);
    let client = client_for(h.config());
    client.connect("alice").await.unwrap();
    let latency = client.state().await.unwrap().latency_ms;

    // Three heartbeats worth of pongs.
    tokio::time::sleep(Duration::from_millis(650)).await;
    let state = client.state().await.unwrap();
    assert!(state.connected);
    assert_eq!(state.latency_ms, latency);
    assert_eq!(h.server.handshakes(), 1);

    *h.server.pong_ts.lock().unwrap() = Some(i64::MAX);
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(client.state().await.unwrap().connected);

    let fire = Envelope::new("note", &json!({})).unwrap();
    client
        .send_websocket_payload(fire, Duration::ZERO)
        .await
        .unwrap();
    h.next_frame("note").await;
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn server_error_frame_keeps_socket_open() {
    let mut h = Harness::start().await;
    let client = client_for(h.config());
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    h.server.push(json!({
        "type": "error",
        "error": {"code": "bad_request", "msg": "unknown type"},
    }));
    match next_event(&mut events, |e| matches!(e, Event::Error(_))).await {
        Event::Error(err) => {
            assert_eq!(err.code, "bad_request");
            assert_eq!(err.msg, "unknown type");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(client.state().await.unwrap().connected);
    let fire = Envelope::new("note", &json!({})).unwrap();
    client
        .send_websocket_payload(fire, Duration::ZERO)
        .await
        .unwrap();
    h.next_frame("note").await;
    assert_eq!(h.server.handshakes(), 1);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn dropped_socket_reports_error_and_reconnects_at_once() {
    let h = Harness::start().await;
    // Any backoff would outlast the test.
    let cfg = h.config().with_options(Options {
        reconnect_interval_ms: 30_000,
        max_reconnect_interval_ms: 30_000,
        ..fast_options()
    });
    let client = client_for(cfg);
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    h.server.kill.notify_one();
    match next_event(&mut events, |e| matches!(e, Event::Error(_))).await {
        Event::Error(err) => assert_eq!(err.code, "websocket_error"),
        other => panic!("unexpected {other:?}"),
    }
    next_event(&mut events, |e| {
        matches!(e, Event::StateChanged(s) if !s.connected && !s.connecting)
    })
    .await;
    next_event(&mut events, |e| matches!(e, Event::StateChanged(s) if s.connected)).await;

    let state = client.state().await.unwrap();
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(h.server.handshakes(), 2);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn closing_our_own_socket_waits_for_backoff() {
    let h = Harness::start().await;
    h.server.answer_pings.store(false, Ordering::SeqCst);
    let cfg = h.config().with_options(Options {
        heartbeat_interval_ms: 100,
        reconnect_interval_ms: 800,
        max_reconnect_interval_ms: 800,
        ..fast_options()
    });
    let client = client_for(cfg);
    let mut events = client.subscribe();
    client.connect("alice").await.unwrap();

    next_event(&mut events, |e| {
        matches!(e, Event::StateChanged(s) if !s.connected && !s.connecting && s.reconnecting)
    })
    .await;
    // Only the first socket gets to time out.
    h.server.answer_pings.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.server.handshakes(), 1);

    eventually(&client, "reconnect after backoff", |s| s.connected).await;
    assert_eq!(h.server.handshakes(), 2);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn connect_timeout_backs_off_without_error_event() {
    let h = Harness::start().await;
    h.server.stall_socket.store(true, Ordering::SeqCst);
    let cfg = h.config().with_options(Options {
        connect_timeout_ms: 100,
        ..fast_options()
    });
    let client = client_for(cfg);
    let mut events = client.subscribe();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("alice").await })
    };
    eventually(&client, "timed out attempts", |s| s.reconnect_attempts >= 2).await;
    let state = client.state().await.unwrap();
    assert!(!state.connected);
    assert!(state.reconnecting);

    h.server.stall_socket.store(false, Ordering::SeqCst);
    waiter.await.unwrap().unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::Error(_)), "unexpected {event:?}");
    }
    client.destroy().await.unwrap();
}
