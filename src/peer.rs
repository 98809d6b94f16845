use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::IceServer;

/// Which side of the offer/answer exchange a peer connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Opaque handle to a local or remote media stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle {
    pub id: String,
}

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PcEvent {
    /// Signaling data to relay to the remote peer.
    Signal(Value),
    Stream(MediaHandle),
    Connect,
    Close,
    Error(String),
    IceStateChange(String),
    SignalingStateChange(String),
}

/// A peer connection event tagged with the record it was created for.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerNotice {
    pub user: String,
    pub pc_id: u64,
    pub event: PcEvent,
}

/// Event sink handed to each peer connection at construction.
///
/// Emitting after the client is gone is a no-op.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    user: String,
    pc_id: u64,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerEvents {
    pub(crate) fn new(user: &str, pc_id: u64, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self {
            user: user.to_string(),
            pc_id,
            tx,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn emit(&self, event: PcEvent) {
        let _ = self.tx.send(PeerNotice {
            user: self.user.clone(),
            pc_id: self.pc_id,
            event,
        });
    }
}

pub trait PeerConnection: Send {
    /// Feeds remote signaling data into the connection.
    fn signal(&mut self, data: Value);
    fn destroy(&mut self);
}

/// Factory for peer connections. Media and ICE live behind this seam.
pub trait PeerConnector: Send + Sync {
    fn create(
        &self,
        role: Role,
        local: Option<MediaHandle>,
        config: &PeerConfig,
        events: PeerEvents,
    ) -> Box<dyn PeerConnection>;
}

/// Signaling-only connector: accepts remote data and never produces media.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedConnector;

struct DetachedPeer {
    events: PeerEvents,
    role: Role,
}

impl PeerConnection for DetachedPeer {
    fn signal(&mut self, data: Value) {
        debug!(user = self.events.user(), role = ?self.role, %data, "signal ignored");
    }

    fn destroy(&mut self) {
        self.events.emit(PcEvent::Close);
    }
}

impl PeerConnector for DetachedConnector {
    fn create(
        &self,
        role: Role,
        _local: Option<MediaHandle>,
        _config: &PeerConfig,
        events: PeerEvents,
    ) -> Box<dyn PeerConnection> {
        Box::new(DetachedPeer { events, role })
    }
}
