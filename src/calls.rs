use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DataError, Result, RtmError};
use crate::events::{Dispatcher, Event, PeerEvent, PeerEventKind, StreamEvent};
use crate::peer::{
    MediaHandle, PcEvent, PeerConfig, PeerConnection, PeerConnector, PeerEvents, PeerNotice, Role,
};
use crate::wsproto::{CallData, Decoded, Envelope, Subtype, WebRtcMessage};

pub const REASON_HANGUP: &str = "hangup";
pub const REASON_BUSY: &str = "reject_busy";
const NO_REASON: &str = "no reason given";

/// Outbound half of the control socket as seen by the call manager.
pub trait FrameSink {
    /// Sends `envelope` and returns the id it went out with.
    fn send_frame(&mut self, envelope: Envelope) -> Result<u64>;
}

/// Read-only copy of a peer record, carried by peer events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub user: String,
    pub initiator: bool,
    /// Our nonce for this call.
    pub state: String,
    /// The peer's nonce, empty until known.
    pub reference: String,
    /// Server issued call id, empty until known.
    pub hash: String,
}

struct ActivePc {
    id: u64,
    conn: Box<dyn PeerConnection>,
}

struct PeerRecord {
    user: String,
    initiator: bool,
    state: String,
    reference: String,
    hash: String,
    epoch: u64,
    pc: Option<ActivePc>,
}

impl PeerRecord {
    fn new(user: &str, initiator: bool, epoch: u64) -> Self {
        Self {
            user: user.to_string(),
            initiator,
            state: nonce(),
            reference: String::new(),
            hash: String::new(),
            epoch,
            pc: None,
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            user: self.user.clone(),
            initiator: self.initiator,
            state: self.state.clone(),
            reference: self.reference.clone(),
            hash: self.hash.clone(),
        }
    }

    fn call_frame(&self, subtype: Subtype, channel: &str, data: Option<CallData>) -> WebRtcMessage {
        WebRtcMessage {
            subtype,
            target: self.user.clone(),
            initiator: self.initiator,
            state: self.state.clone(),
            channel: channel.to_string(),
            hash: self.hash.clone(),
            data: data.map(|d| d.to_value()).unwrap_or(Value::Null),
            ..Default::default()
        }
    }
}

/// An outgoing call waiting for the server's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub user: String,
    pub record_epoch: u64,
    pub frame_id: u64,
}

/// Per-peer call state machine. Owned by the client actor; never shared.
pub struct CallManager {
    channel: Option<String>,
    peers: HashMap<String, PeerRecord>,
    local_stream: Option<MediaHandle>,
    config: PeerConfig,
    connector: Arc<dyn PeerConnector>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    epoch: u64,
}

impl CallManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        config: PeerConfig,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            channel: None,
            peers: HashMap::new(),
            local_stream: None,
            config,
            connector,
            notices,
            epoch: 0,
        }
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn peer(&self, user: &str) -> Option<PeerSnapshot> {
        self.peers.get(user).map(PeerRecord::snapshot)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_pc(&self, user: &str) -> bool {
        self.peers.get(user).is_some_and(|r| r.pc.is_some())
    }

    /// Stream attached to peer connections created from now on.
    pub fn set_local_stream(&mut self, stream: Option<MediaHandle>) {
        self.local_stream = stream;
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// First half of `doCall`: creates the record and sends the offer.
    ///
    /// The caller registers a reply waiter for the returned frame id and
    /// hands the reply to [`CallManager::finish_call`].
    pub fn start_call(
        &mut self,
        user: &str,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) -> Result<PendingCall> {
        if self.channel.is_some() {
            return Err(RtmError::ChannelActive);
        }
        if self.peers.contains_key(user) {
            return Err(RtmError::PeerExists(user.to_string()));
        }

        let epoch = self.next_epoch();
        let record = PeerRecord::new(user, true, epoch);
        let frame = record.call_frame(Subtype::WebrtcCall, "", None);
        events.dispatch(peer_event(PeerEventKind::NewCall, "", &record, None));
        self.peers.insert(user.to_string(), record);

        match Envelope::webrtc(&frame).and_then(|env| sink.send_frame(env)) {
            Ok(frame_id) => {
                info!(user, epoch, frame_id, "call offer sent");
                Ok(PendingCall {
                    user: user.to_string(),
                    record_epoch: epoch,
                    frame_id,
                })
            }
            Err(err) => {
                if let Some(record) = self.peers.remove(user) {
                    events.dispatch(peer_event(PeerEventKind::DestroyCall, "", &record, None));
                }
                Err(err)
            }
        }
    }

    /// Second half of `doCall`: applies the server's reply to the offer.
    pub fn finish_call(
        &mut self,
        pending: &PendingCall,
        reply: &Envelope,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) -> Result<String> {
        let msg = match reply.decode()? {
            Decoded::WebRtc(msg) => msg,
            Decoded::Error(err) => return Err(RtmError::Data(err)),
            _ => {
                return Err(RtmError::Data(DataError::new(
                    "unexpected_reply",
                    reply.kind.clone(),
                )))
            }
        };

        let record = match self.peers.get_mut(&pending.user) {
            Some(record) if record.epoch == pending.record_epoch => record,
            _ => return Err(RtmError::Superseded(pending.user.clone())),
        };
        if !record.hash.is_empty() {
            return Err(RtmError::HashAlreadySet);
        }
        record.hash = msg.hash.clone();

        self.handle_webrtc(msg, sink, events);
        self.channel.clone().ok_or(RtmError::NoChannel)
    }

    pub fn do_answer(
        &mut self,
        user: &str,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) -> Result<String> {
        let channel = self.channel.clone().ok_or(RtmError::NoChannel)?;
        let record = self
            .peers
            .get(user)
            .ok_or_else(|| RtmError::UnknownPeer(user.to_string()))?;

        events.dispatch(peer_event(PeerEventKind::NewCall, &channel, record, None));

        let data = CallData {
            accept: true,
            reason: String::new(),
            state: record.reference.clone(),
        };
        let frame = record.call_frame(Subtype::WebrtcCall, &channel, Some(data));
        sink.send_frame(Envelope::webrtc(&frame)?)?;
        Ok(channel)
    }

    /// Hangs up `user`, or every peer when `None`. Returns the channel as it
    /// was before the hangup.
    pub fn do_hangup(
        &mut self,
        user: Option<&str>,
        reason: &str,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) -> Result<Option<String>> {
        let channel = self.channel.clone();
        match user {
            None => {
                self.channel = None;
                let users: Vec<String> = self.peers.keys().cloned().collect();
                for user in users {
                    self.hangup(channel.as_deref(), &user, reason, sink, events, false);
                }
            }
            Some(user) => {
                if !self.peers.contains_key(user) {
                    return Err(RtmError::UnknownPeer(user.to_string()));
                }
                self.hangup(channel.as_deref(), user, reason, sink, events, false);
            }
        }
        Ok(channel)
    }

    fn hangup(
        &mut self,
        channel: Option<&str>,
        user: &str,
        reason: &str,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
        deferred: bool,
    ) {
        let Some(mut record) = self.peers.remove(user) else {
            return;
        };
        if let Some(mut pc) = record.pc.take() {
            pc.conn.destroy();
        }

        let channel = channel.unwrap_or_default();
        let event = peer_event(PeerEventKind::DestroyCall, channel, &record, None);
        if deferred {
            events.defer(event);
        } else {
            events.dispatch(event);
        }
        info!(user, channel, reason, "call destroyed");

        if reason.is_empty() {
            return;
        }
        let data = CallData {
            accept: false,
            reason: reason.to_string(),
            state: record.reference.clone(),
        };
        let frame = record.call_frame(Subtype::WebrtcHangup, channel, Some(data));
        if let Err(err) = Envelope::webrtc(&frame).and_then(|env| sink.send_frame(env)) {
            warn!(user, error = %err, "failed to send hangup");
        }
    }

    /// Applies an inbound `webrtc` frame. Frames that do not fit the current
    /// state are logged and dropped.
    pub fn handle_webrtc(
        &mut self,
        msg: WebRtcMessage,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) {
        match msg.subtype {
            Subtype::WebrtcCall if msg.initiator => self.on_incoming_call(msg, sink, events),
            Subtype::WebrtcCall => self.on_call_reply(msg, events),
            Subtype::WebrtcChannel => {
                if let Some(current) = &self.channel {
                    debug!(current = %current, channel = %msg.channel, "channel already bound");
                    return;
                }
                self.channel = non_empty(msg.channel);
            }
            Subtype::WebrtcHangup => {
                if self.check_in_call(&msg, "hangup") {
                    let channel = self.channel.clone();
                    self.hangup(channel.as_deref(), &msg.source, "", sink, events, false);
                }
            }
            Subtype::WebrtcSignal => {
                if self.check_in_call(&msg, "signal") {
                    if !self.has_pc(&msg.source) {
                        debug!(user = %msg.source, "creating responder on first signal");
                        self.attach_pc(&msg.source, Role::Responder);
                    }
                    if let Some(pc) = self.peers.get_mut(&msg.source).and_then(|r| r.pc.as_mut()) {
                        pc.conn.signal(msg.data);
                    }
                }
            }
            Subtype::Unknown => debug!("ignoring unknown webrtc subtype"),
        }
    }

    fn on_incoming_call(
        &mut self,
        msg: WebRtcMessage,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) {
        if msg.source.is_empty() {
            info!("incoming call without source");
            return;
        }

        if self.peers.contains_key(&msg.source) {
            if msg.target.is_empty() {
                // Another session of ours took the call.
                let channel = non_empty(msg.channel.clone());
                self.hangup(channel.as_deref(), &msg.source, "", sink, events, true);
                return;
            }
            info!(user = %msg.source, "incoming call from peer we already have");
            self.reject_busy(&msg, sink);
            return;
        }

        if self.channel.is_some() {
            info!(user = %msg.source, "incoming call while busy");
            self.reject_busy(&msg, sink);
            return;
        }

        // A call we accept must bind the one channel.
        if msg.channel.is_empty() {
            info!(user = %msg.source, "incoming call without channel");
            return;
        }

        let epoch = self.next_epoch();
        let mut record = PeerRecord::new(&msg.source, false, epoch);
        record.reference = msg.state;
        record.hash = msg.hash;
        events.defer(peer_event(
            PeerEventKind::IncomingCall,
            &msg.channel,
            &record,
            None,
        ));
        info!(user = %msg.source, channel = %msg.channel, "incoming call");
        self.channel = non_empty(msg.channel);
        self.peers.insert(msg.source, record);
    }

    fn reject_busy(&mut self, msg: &WebRtcMessage, sink: &mut dyn FrameSink) {
        let mut record = PeerRecord::new(&msg.source, false, 0);
        record.reference = msg.state.clone();
        record.hash = msg.hash.clone();
        let data = CallData {
            accept: false,
            reason: REASON_BUSY.to_string(),
            state: record.reference.clone(),
        };
        let frame = record.call_frame(Subtype::WebrtcCall, &msg.channel, Some(data));
        if let Err(err) = Envelope::webrtc(&frame).and_then(|env| sink.send_frame(env)) {
            warn!(user = %msg.source, error = %err, "failed to send busy reject");
        }
    }

    fn on_call_reply(&mut self, msg: WebRtcMessage, events: &mut Dispatcher) {
        let data = msg.call_data();
        let channel = self.channel.clone().unwrap_or_default();
        let Some(record) = self.peers.get_mut(&msg.source) else {
            info!(user = %msg.source, "call reply from unknown peer");
            return;
        };
        if record.state != data.state {
            info!(user = %msg.source, "call reply with wrong state");
            return;
        }
        if record.hash != msg.hash {
            info!(user = %msg.source, "call reply with wrong hash");
            return;
        }
        if !data.accept {
            let reason = if data.reason.is_empty() {
                NO_REASON.to_string()
            } else {
                data.reason
            };
            info!(user = %msg.source, %reason, "peer did not accept call");
            events.defer(peer_event(
                PeerEventKind::AbortCall,
                &channel,
                record,
                Some(reason),
            ));
            return;
        }
        if !record.reference.is_empty() {
            info!(user = %msg.source, "duplicate call accept");
            return;
        }

        record.reference = msg.state;
        let event = peer_event(PeerEventKind::OutgoingCall, &channel, record, None);
        self.attach_pc(&msg.source, Role::Initiator);
        events.defer(event);
    }

    // Hangup and signal frames must belong to the bound channel and, once
    // the peer's nonce is known, carry it.
    fn check_in_call(&self, msg: &WebRtcMessage, what: &str) -> bool {
        if msg.channel.is_empty() || self.channel.as_deref() != Some(msg.channel.as_str()) {
            info!(what, channel = %msg.channel, "wrong channel");
            return false;
        }
        if msg.data.is_null() {
            info!(what, "empty data");
            return false;
        }
        let Some(record) = self.peers.get(&msg.source) else {
            info!(what, user = %msg.source, "unknown peer");
            return false;
        };
        if !record.reference.is_empty() && record.reference != msg.state {
            info!(what, user = %msg.source, "wrong state");
            return false;
        }
        true
    }

    fn attach_pc(&mut self, user: &str, role: Role) {
        let id = self.next_epoch();
        let events = PeerEvents::new(user, id, self.notices.clone());
        let conn = self
            .connector
            .create(role, self.local_stream.clone(), &self.config, events);
        if let Some(record) = self.peers.get_mut(user) {
            if let Some(mut old) = record.pc.replace(ActivePc { id, conn }) {
                old.conn.destroy();
            }
        }
    }

    /// Routes an event from a peer connection. Events from connections that
    /// no longer belong to a record are dropped.
    pub fn handle_peer_notice(
        &mut self,
        notice: PeerNotice,
        sink: &mut dyn FrameSink,
        events: &mut Dispatcher,
    ) {
        let channel = self.channel.clone().unwrap_or_default();
        let Some(record) = self.peers.get_mut(&notice.user) else {
            return;
        };
        if record.pc.as_ref().map(|pc| pc.id) != Some(notice.pc_id) {
            debug!(user = %notice.user, pc_id = notice.pc_id, "stale peer connection event");
            return;
        }

        let (kind, details) = match notice.event {
            PcEvent::Signal(data) => {
                let frame = WebRtcMessage {
                    subtype: Subtype::WebrtcSignal,
                    target: record.user.clone(),
                    state: record.state.clone(),
                    channel,
                    hash: record.hash.clone(),
                    data,
                    ..Default::default()
                };
                if let Err(err) = Envelope::webrtc(&frame).and_then(|env| sink.send_frame(env)) {
                    warn!(user = %record.user, error = %err, "failed to relay signal");
                }
                return;
            }
            PcEvent::Stream(stream) => {
                events.dispatch(Event::Stream(StreamEvent {
                    channel,
                    record: record.snapshot(),
                    stream,
                }));
                return;
            }
            PcEvent::Close => {
                record.pc = None;
                (PeerEventKind::PcClosed, None)
            }
            PcEvent::Connect => (PeerEventKind::PcConnect, None),
            PcEvent::Error(err) => (PeerEventKind::PcError, Some(err)),
            PcEvent::IceStateChange(state) => (PeerEventKind::PcIceStateChange, Some(state)),
            PcEvent::SignalingStateChange(state) => {
                (PeerEventKind::PcSignalingStateChange, Some(state))
            }
        };
        events.dispatch(peer_event(kind, &channel, record, details));
    }
}

fn peer_event(
    kind: PeerEventKind,
    channel: &str,
    record: &PeerRecord,
    details: Option<String>,
) -> Event {
    Event::Peer(PeerEvent {
        kind,
        channel: channel.to_string(),
        record: record.snapshot(),
        details,
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Twelve hex characters of randomness.
pub fn nonce() -> String {
    hex::encode(rand::random::<[u8; 6]>())
}
