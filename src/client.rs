use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::calls::{CallManager, FrameSink, PendingCall, REASON_HANGUP};
use crate::config::Config;
use crate::error::{DataError, Result, RtmError};
use crate::events::{ConnectionState, Dispatcher, Event};
use crate::http::ApiClient;
use crate::peer::{MediaHandle, PeerConfig, PeerConnector, PeerNotice};
use crate::replies::ReplyRegistry;
use crate::telemetry::LatencyMeter;
use crate::wsproto::{decode_text, encode_text, Decoded, Envelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMMAND_BUFFER: usize = 64;

/// Handle to a signaling client.
///
/// All state lives in a single actor task; handles are cheap to clone and
/// the actor stops once the last one is dropped.
#[derive(Clone)]
pub struct RtmClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

impl RtmClient {
    /// Spawns the client actor on the current tokio runtime.
    pub fn new(cfg: Config, connector: Arc<dyn PeerConnector>) -> Result<Self> {
        let api = ApiClient::new(&cfg.server_url)?;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let events = Dispatcher::new();
        let sender = events.sender();
        let calls = CallManager::new(
            connector,
            PeerConfig {
                ice_servers: cfg.ice_servers.clone(),
            },
            notice_tx,
        );
        let state = ConnectionState {
            auth_token: cfg.auth_token.clone(),
            ..Default::default()
        };
        let actor = Actor {
            cfg,
            api,
            user: None,
            state,
            latency: LatencyMeter::new(),
            link: Link {
                slot: SocketSlot::Idle,
                next_id: 0,
            },
            socket_epoch: 0,
            retired_epoch: 0,
            connect_gen: 0,
            reconnect_gen: 0,
            reconnect_timer: None,
            heartbeat: None,
            waiters: Vec::new(),
            replies: ReplyRegistry::new(),
            calls,
            events,
            commands: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx, notice_rx));
        Ok(Self {
            commands: tx,
            events: sender,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RtmError::Shutdown)?;
        rx.await.map_err(|_| RtmError::Shutdown)
    }

    /// Connects as `user`. Resolves once a socket is up, which may take
    /// several reconnect attempts; fails when reconnecting is off or stops.
    pub async fn connect(&self, user: &str) -> Result<()> {
        let user = user.to_string();
        self.request(|respond| Command::Connect { user, respond })
            .await?
    }

    /// Stops reconnecting, hangs up every call and closes the socket.
    pub async fn destroy(&self) -> Result<()> {
        self.request(|respond| Command::Destroy { respond }).await?
    }

    /// Calls `user` and returns the channel the server bound the call to.
    pub async fn do_call(&self, user: &str) -> Result<String> {
        let user = user.to_string();
        self.request(|respond| Command::Call { user, respond })
            .await?
    }

    pub async fn do_answer(&self, user: &str) -> Result<String> {
        let user = user.to_string();
        self.request(|respond| Command::Answer { user, respond })
            .await?
    }

    /// Hangs up `user`, or every call when `None`. `reason` defaults to
    /// `hangup`; an empty reason tears down locally without telling the peer.
    pub async fn do_hangup(&self, user: Option<&str>, reason: Option<&str>) -> Result<Option<String>> {
        let user = user.map(str::to_string);
        let reason = reason.unwrap_or(REASON_HANGUP).to_string();
        self.request(|respond| Command::Hangup {
            user,
            reason,
            respond,
        })
        .await?
    }

    pub async fn set_local_stream(&self, stream: Option<MediaHandle>) -> Result<()> {
        self.commands
            .send(Command::SetLocalStream(stream))
            .await
            .map_err(|_| RtmError::Shutdown)
    }

    /// Sends a raw frame. With a zero `reply_timeout` this returns `None` as
    /// soon as the frame is queued; otherwise it waits for the correlated
    /// reply or fails with [`RtmError::Timeout`].
    pub async fn send_websocket_payload(
        &self,
        payload: Envelope,
        reply_timeout: Duration,
    ) -> Result<Option<Envelope>> {
        self.request(|respond| Command::Send {
            payload,
            reply_timeout,
            respond,
        })
        .await?
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(|respond| Command::State { respond }).await
    }
}

enum Command {
    Connect {
        user: String,
        respond: oneshot::Sender<Result<()>>,
    },
    Destroy {
        respond: oneshot::Sender<Result<()>>,
    },
    Call {
        user: String,
        respond: oneshot::Sender<Result<String>>,
    },
    Answer {
        user: String,
        respond: oneshot::Sender<Result<String>>,
    },
    Hangup {
        user: Option<String>,
        reason: String,
        respond: oneshot::Sender<Result<Option<String>>>,
    },
    SetLocalStream(Option<MediaHandle>),
    Send {
        payload: Envelope,
        reply_timeout: Duration,
        respond: oneshot::Sender<Result<Option<Envelope>>>,
    },
    State {
        respond: oneshot::Sender<ConnectionState>,
    },
    Handshake {
        generation: u64,
        result: Result<String>,
    },
    SocketOpened {
        epoch: u64,
        result: Result<WsStream>,
        elapsed: Duration,
    },
    Frame {
        epoch: u64,
        text: String,
    },
    SocketError {
        epoch: u64,
        error: String,
    },
    SocketClosed {
        epoch: u64,
    },
    HeartbeatTick {
        epoch: u64,
    },
    ReconnectDue {
        generation: u64,
    },
    ReplyDeadline {
        id: u64,
    },
}

enum ReplyRoute {
    External(oneshot::Sender<Result<Option<Envelope>>>),
    Heartbeat {
        epoch: u64,
    },
    Call {
        pending: PendingCall,
        respond: oneshot::Sender<Result<String>>,
    },
}

struct ActiveSocket {
    epoch: u64,
    writer: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl ActiveSocket {
    fn close(self) {
        let _ = self.writer.send(Message::Close(None));
        self.reader.abort();
    }
}

enum SocketSlot {
    Idle,
    Opening { epoch: u64 },
    Open(ActiveSocket),
}

/// The socket plus the frame id counter.
struct Link {
    slot: SocketSlot,
    next_id: u64,
}

impl Link {
    fn current_epoch(&self) -> Option<u64> {
        match &self.slot {
            SocketSlot::Open(sock) => Some(sock.epoch),
            _ => None,
        }
    }

    fn is_opening(&self, epoch: u64) -> bool {
        matches!(self.slot, SocketSlot::Opening { epoch: e } if e == epoch)
    }

    fn take_open(&mut self) -> Option<ActiveSocket> {
        match std::mem::replace(&mut self.slot, SocketSlot::Idle) {
            SocketSlot::Open(sock) => Some(sock),
            other => {
                self.slot = other;
                None
            }
        }
    }
}

impl FrameSink for Link {
    fn send_frame(&mut self, mut envelope: Envelope) -> Result<u64> {
        let SocketSlot::Open(sock) = &self.slot else {
            return Err(RtmError::NoConnection);
        };
        self.next_id += 1;
        envelope.id = self.next_id;
        let text = encode_text(&envelope)?;
        sock.writer
            .send(Message::Text(text))
            .map_err(|_| RtmError::NoConnection)?;
        Ok(envelope.id)
    }
}

struct Actor {
    cfg: Config,
    api: ApiClient,
    user: Option<String>,
    state: ConnectionState,
    latency: LatencyMeter,
    link: Link,
    socket_epoch: u64,
    // Highest epoch we closed ourselves. Close events for those never
    // trigger the immediate reconnect.
    retired_epoch: u64,
    connect_gen: u64,
    reconnect_gen: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    replies: ReplyRegistry<ReplyRoute>,
    calls: CallManager,
    events: Dispatcher,
    commands: mpsc::WeakSender<Command>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut notices: mpsc::UnboundedReceiver<PeerNotice>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(notice) = notices.recv() => {
                    self.calls.handle_peer_notice(notice, &mut self.link, &mut self.events);
                }
            }
            self.events.flush();
        }
        debug!("all client handles dropped, shutting down");
        let _ = self.destroy();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { user, respond } => {
                self.waiters.push(respond);
                self.start_connect(user);
            }
            Command::Destroy { respond } => {
                let _ = respond.send(self.destroy());
            }
            Command::Call { user, respond } => self.start_call(&user, respond),
            Command::Answer { user, respond } => {
                let res = self
                    .calls
                    .do_answer(&user, &mut self.link, &mut self.events);
                let _ = respond.send(res);
            }
            Command::Hangup {
                user,
                reason,
                respond,
            } => {
                let res = self.calls.do_hangup(
                    user.as_deref(),
                    &reason,
                    &mut self.link,
                    &mut self.events,
                );
                let _ = respond.send(res);
            }
            Command::SetLocalStream(stream) => self.calls.set_local_stream(stream),
            Command::Send {
                payload,
                reply_timeout,
                respond,
            } => self.send_payload(payload, reply_timeout, respond),
            Command::State { respond } => {
                let _ = respond.send(self.state.clone());
            }
            Command::Handshake { generation, result } => self.on_handshake(generation, result),
            Command::SocketOpened {
                epoch,
                result,
                elapsed,
            } => self.on_socket_opened(epoch, result, elapsed),
            Command::Frame { epoch, text } => self.on_frame(epoch, &text),
            Command::SocketError { epoch, error } => self.on_socket_error(epoch, error),
            Command::SocketClosed { epoch } => self.on_socket_closed(epoch),
            Command::HeartbeatTick { epoch } => self.on_heartbeat_tick(epoch),
            Command::ReconnectDue { generation } => {
                if generation != self.reconnect_gen {
                    return;
                }
                self.reconnect_timer = None;
                if let Some(user) = self.user.clone() {
                    self.start_connect(user);
                }
            }
            Command::ReplyDeadline { id } => self.on_reply_deadline(id),
        }
    }

    fn dispatch_state(&mut self) {
        self.events.dispatch(Event::StateChanged(self.state.clone()));
    }

    fn authorization(&self) -> Option<String> {
        match (self.cfg.auth_type, self.state.auth_token.as_deref()) {
            (Some(kind), Some(value)) if !value.is_empty() => {
                Some(format!("{} {}", kind.as_str(), value))
            }
            _ => None,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.reconnect_gen += 1;
        self.stop_heartbeat();
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn start_connect(&mut self, user: String) {
        self.cancel_timers();
        self.user = Some(user.clone());
        self.state.reconnecting = self.cfg.options.reconnect_enabled;
        self.state.connecting = true;
        self.latency.clear();
        self.dispatch_state();

        self.connect_gen += 1;
        let generation = self.connect_gen;
        let api = self.api.clone();
        let authorization = self.authorization();
        let commands = self.commands.clone();
        info!(user = %user, generation, "connecting");
        tokio::spawn(async move {
            let result = match api.rtm_connect(&user, authorization.as_deref()).await {
                Ok(resp) => resp.into_url(),
                Err(err) => Err(RtmError::Data(DataError::new(
                    "request_failed",
                    err.to_string(),
                ))),
            };
            notify(&commands, Command::Handshake { generation, result }).await;
        });
    }

    fn on_handshake(&mut self, generation: u64, result: Result<String>) {
        if generation != self.connect_gen {
            debug!(generation, "stale handshake result");
            return;
        }
        let request = match result
            .and_then(|url| self.api.socket_url(&url))
            .and_then(|url| self.socket_request(&url))
        {
            Ok(request) => request,
            Err(err) => return self.on_connect_failed(err),
        };

        if let Some(old) = self.link.take_open() {
            warn!(epoch = old.epoch, "closing existing socket connection");
            self.retire(old);
            self.stop_heartbeat();
            self.state.connected = false;
        }
        self.socket_epoch += 1;
        let epoch = self.socket_epoch;
        self.link.slot = SocketSlot::Opening { epoch };

        let connect_timeout = self.cfg.options.connect_timeout();
        let commands = self.commands.clone();
        debug!(epoch, uri = %request.uri(), "opening socket");
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(connect_timeout, connect_async(request)).await
            {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(err)) => Err(RtmError::WebSocket(err)),
                Err(_) => Err(RtmError::ConnectTimeout),
            };
            let elapsed = started.elapsed();
            notify(
                &commands,
                Command::SocketOpened {
                    epoch,
                    result,
                    elapsed,
                },
            )
            .await;
        });
    }

    fn socket_request(&self, url: &Url) -> Result<Request> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(proto) = &self.cfg.ws_subprotocol {
            let value = HeaderValue::from_str(proto)
                .map_err(|_| DataError::new("invalid_subprotocol", proto.clone()))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }

    fn on_connect_failed(&mut self, err: RtmError) {
        warn!(error = %err, "connect failed");
        self.state.connecting = false;
        self.dispatch_state();
        if !self.state.reconnecting {
            self.reject_waiters(err);
            return;
        }
        if err.is_fatal() {
            warn!("giving up reconnect, as connect returned forbidden");
            self.state.reconnecting = false;
            self.dispatch_state();
            if let RtmError::Data(data) = &err {
                self.events.dispatch(Event::Error(data.clone()));
            }
            self.reject_waiters(err);
            return;
        }
        self.schedule_reconnect(false);
    }

    fn reject_waiters(&mut self, err: RtmError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.duplicate()));
        }
    }

    fn on_socket_opened(&mut self, epoch: u64, result: Result<WsStream>, elapsed: Duration) {
        if !self.link.is_opening(epoch) {
            if let Ok(mut stream) = result {
                debug!(epoch, "discarding socket opened for a stale attempt");
                tokio::spawn(async move {
                    let _ = stream.close(None).await;
                });
            }
            return;
        }
        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                self.link.slot = SocketSlot::Idle;
                self.state.connected = false;
                if !matches!(err, RtmError::ConnectTimeout) {
                    self.events.dispatch(Event::Error(DataError::new(
                        "websocket_error",
                        err.to_string(),
                    )));
                }
                return self.on_connect_failed(err);
            }
        };

        let (sink, source) = stream.split();
        let (writer, outbox) = mpsc::unbounded_channel();
        tokio::spawn(write_socket(sink, outbox));
        let reader = tokio::spawn(read_socket(epoch, source, self.commands.clone()));
        self.link.slot = SocketSlot::Open(ActiveSocket {
            epoch,
            writer,
            reader,
        });

        let latency = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.state.connected = true;
        self.state.connecting = false;
        self.state.reconnect_attempts = 0;
        self.state.latency_ms = self.latency.push(latency);
        info!(epoch, latency_ms = latency, "connection established");
        self.dispatch_state();
        self.start_heartbeat(epoch);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn retire(&mut self, sock: ActiveSocket) {
        self.retired_epoch = self.retired_epoch.max(sock.epoch);
        sock.close();
    }

    fn on_current_closed(&mut self) {
        self.stop_heartbeat();
        self.state.connected = false;
        self.state.connecting = false;
        self.dispatch_state();
        self.schedule_reconnect(false);
    }

    fn on_socket_closed(&mut self, epoch: u64) {
        if self.link.current_epoch() == Some(epoch) {
            info!(epoch, "socket closed");
            self.link.take_open();
            self.on_current_closed();
            return;
        }
        let vanished = matches!(self.link.slot, SocketSlot::Idle);
        if vanished
            && !self.state.connecting
            && self.state.reconnecting
            && epoch > self.retired_epoch
        {
            debug!(epoch, "socket closed, retry immediate reconnect now");
            self.schedule_reconnect(true);
        }
    }

    fn on_socket_error(&mut self, epoch: u64, error: String) {
        if self.link.current_epoch() != Some(epoch) {
            return;
        }
        warn!(epoch, %error, "socket error");
        self.link.take_open();
        self.stop_heartbeat();
        self.state.connected = false;
        self.state.connecting = false;
        self.events
            .dispatch(Event::Error(DataError::new("websocket_error", error)));
        self.dispatch_state();
    }

    fn schedule_reconnect(&mut self, fast: bool) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if !self.state.reconnecting {
            return;
        }
        let delay = if fast {
            Duration::ZERO
        } else {
            let opts = &self.cfg.options;
            opts.reconnect_delay(self.state.reconnect_attempts) + opts.reconnect_jitter()
        };
        self.reconnect_gen += 1;
        let generation = self.reconnect_gen;
        info!(
            attempt = self.state.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            fast,
            "reconnect scheduled"
        );
        let commands = self.commands.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            notify(&commands, Command::ReconnectDue { generation }).await;
        }));
        self.state.reconnect_attempts = self.state.reconnect_attempts.saturating_add(1);
    }

    fn start_heartbeat(&mut self, epoch: u64) {
        self.stop_heartbeat();
        let interval = self.cfg.options.heartbeat_interval();
        let commands = self.commands.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if !notify(&commands, Command::HeartbeatTick { epoch }).await {
                    break;
                }
            }
        }));
    }

    fn on_heartbeat_tick(&mut self, epoch: u64) {
        if self.link.current_epoch() != Some(epoch) {
            return;
        }
        let sent = Envelope::ping(now_ms()).and_then(|ping| self.link.send_frame(ping));
        match sent {
            Ok(id) => {
                let timeout = self
                    .cfg
                    .options
                    .heartbeat_reply_timeout()
                    .max(Duration::from_millis(1));
                self.expect_reply(id, timeout, ReplyRoute::Heartbeat { epoch });
            }
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                self.on_heartbeat_timeout(epoch);
            }
        }
    }

    fn on_heartbeat_timeout(&mut self, epoch: u64) {
        if self.link.current_epoch() != Some(epoch) {
            return;
        }
        warn!(epoch, "heartbeat timeout, closing socket");
        if let Some(sock) = self.link.take_open() {
            self.retire(sock);
        }
        self.on_current_closed();
    }

    fn on_pong(&mut self, epoch: u64, envelope: &Envelope) {
        let Ok(Decoded::Pong(pong)) = envelope.decode() else {
            return;
        };
        // The echoed timestamp comes from the wire; skip samples that cannot
        // be ours.
        match u64::try_from(now_ms().saturating_sub(pong.ts)) {
            Ok(sample) if pong.ts > 0 => {
                let mean = self.latency.push(sample);
                if self.link.current_epoch() == Some(epoch) {
                    self.state.latency_ms = mean;
                }
            }
            _ => debug!(ts = pong.ts, "pong with bogus timestamp"),
        }
        if let Some(auth) = pong.auth {
            if self.cfg.auth_type.is_some() {
                debug!("auth token refreshed by pong");
                self.state.auth_token = Some(auth);
            }
        }
    }

    fn on_goodbye(&mut self) {
        info!("server goodbye, close connection");
        // Go through backoff rather than reconnecting instantly.
        self.state.reconnect_attempts = self.state.reconnect_attempts.max(1);
        if let Some(sock) = self.link.take_open() {
            self.retire(sock);
            self.on_current_closed();
        }
    }

    fn on_frame(&mut self, epoch: u64, text: &str) {
        if self.link.current_epoch() != Some(epoch) {
            debug!(epoch, "frame from stale socket");
            return;
        }
        let envelope = match decode_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                info!(error = %err, "dropping malformed frame");
                return;
            }
        };

        if let Some(id) = envelope.reply_key() {
            match self.replies.take(id) {
                Some(route) => self.on_reply(route, envelope),
                None => debug!(id, kind = %envelope.kind, "received reply without handler"),
            }
            return;
        }

        match envelope.decode() {
            Ok(Decoded::Hello) => debug!("server hello"),
            Ok(Decoded::Goodbye) => self.on_goodbye(),
            Ok(Decoded::Error(err)) => {
                warn!(%err, "server error");
                self.events.dispatch(Event::Error(err));
            }
            Ok(Decoded::WebRtc(msg)) => {
                self.calls
                    .handle_webrtc(msg, &mut self.link, &mut self.events)
            }
            Ok(Decoded::Pong(_)) | Ok(Decoded::Other(_)) => {
                debug!(kind = %envelope.kind, "unknown type")
            }
            Err(err) => info!(error = %err, kind = %envelope.kind, "dropping invalid frame"),
        }
    }

    fn on_reply(&mut self, route: ReplyRoute, envelope: Envelope) {
        match route {
            ReplyRoute::External(respond) => {
                let _ = respond.send(Ok(Some(envelope)));
            }
            ReplyRoute::Heartbeat { epoch } => self.on_pong(epoch, &envelope),
            ReplyRoute::Call { pending, respond } => {
                let res = self.calls.finish_call(
                    &pending,
                    &envelope,
                    &mut self.link,
                    &mut self.events,
                );
                let _ = respond.send(res);
            }
        }
    }

    fn on_reply_deadline(&mut self, id: u64) {
        let Some(route) = self.replies.take(id) else {
            return;
        };
        debug!(id, "reply timed out");
        match route {
            ReplyRoute::External(respond) => {
                let _ = respond.send(Err(RtmError::Timeout));
            }
            ReplyRoute::Heartbeat { epoch } => self.on_heartbeat_timeout(epoch),
            ReplyRoute::Call { pending, respond } => {
                warn!(user = %pending.user, "call offer timed out");
                let _ = respond.send(Err(RtmError::Timeout));
            }
        }
    }

    fn expect_reply(&mut self, id: u64, timeout: Duration, route: ReplyRoute) {
        let commands = self.commands.clone();
        let deadline = tokio::spawn(async move {
            sleep(timeout).await;
            notify(&commands, Command::ReplyDeadline { id }).await;
        });
        self.replies.register(id, route, deadline);
    }

    fn send_payload(
        &mut self,
        payload: Envelope,
        reply_timeout: Duration,
        respond: oneshot::Sender<Result<Option<Envelope>>>,
    ) {
        match self.link.send_frame(payload) {
            Ok(id) if !reply_timeout.is_zero() => {
                self.expect_reply(id, reply_timeout, ReplyRoute::External(respond))
            }
            Ok(_) => {
                let _ = respond.send(Ok(None));
            }
            Err(err) => {
                let _ = respond.send(Err(err));
            }
        }
    }

    fn start_call(&mut self, user: &str, respond: oneshot::Sender<Result<String>>) {
        match self
            .calls
            .start_call(user, &mut self.link, &mut self.events)
        {
            Ok(pending) => {
                let id = pending.frame_id;
                let timeout = self.cfg.options.call_reply_timeout();
                self.expect_reply(id, timeout, ReplyRoute::Call { pending, respond });
            }
            Err(err) => {
                let _ = respond.send(Err(err));
            }
        }
    }

    fn destroy(&mut self) -> Result<()> {
        info!(pending_replies = self.replies.len(), "destroying client");
        self.state.reconnecting = false;
        self.cancel_timers();
        self.connect_gen += 1;

        self.calls
            .do_hangup(None, REASON_HANGUP, &mut self.link, &mut self.events)
            .map_err(|err| RtmError::Destroy(Box::new(err)))?;

        if let SocketSlot::Open(sock) = std::mem::replace(&mut self.link.slot, SocketSlot::Idle) {
            self.retire(sock);
        }
        self.state.connected = false;
        self.state.connecting = false;
        self.dispatch_state();
        self.reject_waiters(RtmError::Shutdown);
        Ok(())
    }
}

async fn notify(commands: &mpsc::WeakSender<Command>, cmd: Command) -> bool {
    match commands.upgrade() {
        Some(tx) => tx.send(cmd).await.is_ok(),
        None => false,
    }
}

async fn write_socket(
    mut sink: SplitSink<WsStream, Message>,
    mut outbox: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbox.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(err) = sink.send(msg).await {
            debug!(error = %err, "socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_socket(
    epoch: u64,
    mut source: SplitStream<WsStream>,
    commands: mpsc::WeakSender<Command>,
) {
    while let Some(msg) = source.next().await {
        let delivered = match msg {
            Ok(Message::Text(text)) => notify(&commands, Command::Frame { epoch, text }).await,
            Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                Ok(text) => notify(&commands, Command::Frame { epoch, text }).await,
                Err(_) => true,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => true,
            Err(err) => {
                let error = err.to_string();
                notify(&commands, Command::SocketError { epoch, error }).await;
                break;
            }
        };
        if !delivered {
            return;
        }
    }
    notify(&commands, Command::SocketClosed { epoch }).await;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
