use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Error code reported by the handshake endpoint when the user is not allowed
/// to connect. Reconnecting will not help.
pub const FORBIDDEN_CODE: &str = "http_error_403";

/// `{code, msg}` error payload used by the handshake response and by `error`
/// frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataError {
    #[serde(default, deserialize_with = "deserialize_code")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
}

impl DataError {
    pub fn new(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg: msg.into(),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == FORBIDDEN_CODE
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.msg)
        }
    }
}

// Some server builds send numeric error ids.
fn deserialize_code<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for error code, got {other}"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RtmError {
    #[error("no_connection")]
    NoConnection,
    #[error("timeout")]
    Timeout,
    #[error("connect_timeout")]
    ConnectTimeout,
    #[error("{0}")]
    Data(DataError),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("url: {0}")]
    Url(#[from] url::ParseError),
    #[error("already have a channel")]
    ChannelActive,
    #[error("peer already exists: {0}")]
    PeerExists(String),
    #[error("no channel")]
    NoChannel,
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("unknown or invalid peer: {0}")]
    Superseded(String),
    #[error("record already has a hash")]
    HashAlreadySet,
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("client is shut down")]
    Shutdown,
    #[error("failed to destroy: {0}")]
    Destroy(Box<RtmError>),
}

impl RtmError {
    /// Fatal errors stop the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RtmError::Data(err) if err.is_forbidden())
    }

    /// Copy of this error for handing one failure to several waiters.
    /// Wrapped transport errors keep only their message.
    pub(crate) fn duplicate(&self) -> RtmError {
        match self {
            RtmError::NoConnection => RtmError::NoConnection,
            RtmError::Timeout => RtmError::Timeout,
            RtmError::ConnectTimeout => RtmError::ConnectTimeout,
            RtmError::Data(err) => RtmError::Data(err.clone()),
            RtmError::WebSocket(err) => DataError::new("websocket_error", err.to_string()).into(),
            RtmError::Http(err) => DataError::new("request_failed", err.to_string()).into(),
            RtmError::Json(err) => DataError::new("invalid_json", err.to_string()).into(),
            RtmError::Url(err) => DataError::new("invalid_url", err.to_string()).into(),
            RtmError::ChannelActive => RtmError::ChannelActive,
            RtmError::PeerExists(user) => RtmError::PeerExists(user.clone()),
            RtmError::NoChannel => RtmError::NoChannel,
            RtmError::UnknownPeer(user) => RtmError::UnknownPeer(user.clone()),
            RtmError::Superseded(user) => RtmError::Superseded(user.clone()),
            RtmError::HashAlreadySet => RtmError::HashAlreadySet,
            RtmError::UnknownPlugin(name) => RtmError::UnknownPlugin(name.clone()),
            RtmError::Shutdown => RtmError::Shutdown,
            RtmError::Destroy(inner) => RtmError::Destroy(Box::new(inner.duplicate())),
        }
    }
}

impl From<DataError> for RtmError {
    fn from(err: DataError) -> Self {
        RtmError::Data(err)
    }
}

pub type Result<T, E = RtmError> = std::result::Result<T, E>;
