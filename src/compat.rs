//! Adapter exposing the client through the legacy VideoCall plugin API.
//!
//! Legacy consumers send `{request: ...}` messages and receive
//! `{event: ...}` callbacks. Only the call events they know about are
//! forwarded; everything else stays on the typed event stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::calls::PeerSnapshot;
use crate::client::RtmClient;
use crate::error::{Result, RtmError};
use crate::events::{Event, PeerEvent, PeerEventKind};
use crate::peer::MediaHandle;

pub const VIDEOCALL_PLUGIN: &str = "janus.plugin.videocall";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum LegacyRequest {
    Register { username: String },
    Call { username: String },
    Hangup,
    /// Accepts the incoming call from `user`.
    Accept { user: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyMessage {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip)]
    pub record: Option<PeerSnapshot>,
}

impl LegacyMessage {
    fn registered() -> Self {
        Self {
            event: "registered".to_string(),
            channel: None,
            record: None,
        }
    }
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
pub struct Callbacks {
    pub on_message: Option<Callback<LegacyMessage>>,
    pub on_remote_stream: Option<Callback<MediaHandle>>,
    pub on_error: Option<Callback<RtmError>>,
}

impl Callbacks {
    fn message(&self, msg: LegacyMessage) {
        if let Some(cb) = &self.on_message {
            cb(msg);
        }
    }

    fn error(&self, err: RtmError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}

/// Maps a typed peer event to the legacy message it corresponds to.
pub fn translate(event: &PeerEvent) -> Option<LegacyMessage> {
    let name = match event.kind {
        PeerEventKind::IncomingCall => "incomingcall",
        PeerEventKind::OutgoingCall => "accepted",
        PeerEventKind::DestroyCall => "hangup",
        _ => return None,
    };
    Some(LegacyMessage {
        event: name.to_string(),
        channel: Some(event.channel.clone()),
        record: Some(event.record.clone()),
    })
}

/// Looks up a plugin by name and binds it to `client`.
pub fn attach(client: &RtmClient, plugin: &str, callbacks: Callbacks) -> Result<VideoCall> {
    if plugin != VIDEOCALL_PLUGIN {
        return Err(RtmError::UnknownPlugin(plugin.to_string()));
    }
    Ok(VideoCall::new(client.clone(), callbacks))
}

pub struct VideoCall {
    client: RtmClient,
    callbacks: Arc<Callbacks>,
    pump: JoinHandle<()>,
}

impl VideoCall {
    fn new(client: RtmClient, callbacks: Callbacks) -> Self {
        let callbacks = Arc::new(callbacks);
        let mut events = client.subscribe();
        let cbs = callbacks.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::Peer(event)) => {
                        if let Some(msg) = translate(&event) {
                            cbs.message(msg);
                        }
                    }
                    Ok(Event::Stream(event)) => {
                        if let Some(cb) = &cbs.on_remote_stream {
                            cb(event.stream);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "videocall adapter lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self {
            client,
            callbacks,
            pump,
        }
    }

    /// Runs a legacy request. Failures are reported through `on_error` as
    /// well as returned.
    pub async fn send(&self, request: LegacyRequest) -> Result<()> {
        debug!(?request, "videocall send");
        let res = match request {
            LegacyRequest::Register { username } => self
                .client
                .connect(&username)
                .await
                .map(|()| self.callbacks.message(LegacyMessage::registered())),
            LegacyRequest::Call { username } => self.client.do_call(&username).await.map(drop),
            LegacyRequest::Hangup => self.client.do_hangup(None, None).await.map(drop),
            LegacyRequest::Accept { user } => self.client.do_answer(&user).await.map(drop),
        };
        if let Err(err) = &res {
            self.callbacks.error(err.duplicate());
        }
        res
    }

    pub async fn create_offer(&self, stream: Option<MediaHandle>) -> Result<()> {
        self.client.set_local_stream(stream).await
    }

    pub async fn create_answer(&self, stream: Option<MediaHandle>) -> Result<()> {
        self.client.set_local_stream(stream).await
    }

    pub async fn detach(self) -> Result<()> {
        self.pump.abort();
        self.client.set_local_stream(None).await
    }
}

impl Drop for VideoCall {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
