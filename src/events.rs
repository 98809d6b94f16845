use std::fmt;

use tokio::sync::broadcast;

use crate::calls::PeerSnapshot;
use crate::error::DataError;
use crate::peer::MediaHandle;

const EVENT_BUFFER: usize = 256;

/// Snapshot of the connection manager's flags.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connecting: bool,
    pub connected: bool,
    pub reconnecting: bool,
    pub latency_ms: u64,
    pub reconnect_attempts: u32,
    pub auth_token: Option<String>,
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connecting", &self.connecting)
            .field("connected", &self.connected)
            .field("reconnecting", &self.reconnecting)
            .field("latency_ms", &self.latency_ms)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    NewCall,
    IncomingCall,
    OutgoingCall,
    DestroyCall,
    AbortCall,
    PcError,
    PcConnect,
    PcClosed,
    PcIceStateChange,
    PcSignalingStateChange,
}

impl PeerEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerEventKind::NewCall => "newcall",
            PeerEventKind::IncomingCall => "incomingcall",
            PeerEventKind::OutgoingCall => "outgoingcall",
            PeerEventKind::DestroyCall => "destroycall",
            PeerEventKind::AbortCall => "abortcall",
            PeerEventKind::PcError => "pc.error",
            PeerEventKind::PcConnect => "pc.connect",
            PeerEventKind::PcClosed => "pc.closed",
            PeerEventKind::PcIceStateChange => "pc.iceStateChange",
            PeerEventKind::PcSignalingStateChange => "pc.signalingStateChange",
        }
    }
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub channel: String,
    pub record: PeerSnapshot,
    /// Abort reason, error text or the new ICE/signaling state.
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub channel: String,
    pub record: PeerSnapshot,
    pub stream: MediaHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(ConnectionState),
    Error(DataError),
    Peer(PeerEvent),
    Stream(StreamEvent),
}

/// Fans events out to subscribers.
///
/// `dispatch` publishes right away. `defer` holds the event until `flush`,
/// which the client calls once the current command or frame has been fully
/// applied.
pub struct Dispatcher {
    sender: broadcast::Sender<Event>,
    deferred: Vec<Event>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sender,
            deferred: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishing side, for handles that hand out their own receivers.
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.sender.clone()
    }

    pub fn dispatch(&mut self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn defer(&mut self, event: Event) {
        self.deferred.push(event);
    }

    pub fn flush(&mut self) {
        for event in std::mem::take(&mut self.deferred) {
            let _ = self.sender.send(event);
        }
    }

    pub fn pending(&self) -> usize {
        self.deferred.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
