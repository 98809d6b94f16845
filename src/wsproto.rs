use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DataError, Result};

pub const TYPE_HELLO: &str = "hello";
pub const TYPE_GOODBYE: &str = "goodbye";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_WEBRTC: &str = "webrtc";

/// One JSON frame on the control socket.
///
/// `id` is assigned by the sender when the frame goes out. Replies carry the
/// originating id in `reply_to`; everything else lives in `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, body: &T) -> Result<Self> {
        let body = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Ok(Self {
            id: 0,
            kind: kind.to_string(),
            reply_to: None,
            body,
        })
    }

    pub fn ping(ts: i64) -> Result<Self> {
        Self::new(TYPE_PING, &PingPong { ts, auth: None })
    }

    pub fn webrtc(msg: &WebRtcMessage) -> Result<Self> {
        Self::new(TYPE_WEBRTC, msg)
    }

    /// Id of the request this frame answers, if any.
    ///
    /// Pongs echo the ping verbatim, so their own `id` is the correlation key.
    pub fn reply_key(&self) -> Option<u64> {
        if self.kind == TYPE_PONG {
            return Some(self.id);
        }
        self.reply_to.filter(|id| *id != 0)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    pub fn decode(&self) -> Result<Decoded> {
        match self.kind.as_str() {
            TYPE_HELLO => Ok(Decoded::Hello),
            TYPE_GOODBYE => Ok(Decoded::Goodbye),
            TYPE_ERROR => {
                let body: ErrorBody = self.body_as()?;
                Ok(Decoded::Error(body.error))
            }
            TYPE_PONG => Ok(Decoded::Pong(self.body_as()?)),
            TYPE_WEBRTC => Ok(Decoded::WebRtc(self.body_as()?)),
            other => Ok(Decoded::Other(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Hello,
    Goodbye,
    Error(DataError),
    Pong(PingPong),
    WebRtc(WebRtcMessage),
    Other(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: DataError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPong {
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtype {
    WebrtcCall,
    WebrtcChannel,
    WebrtcHangup,
    WebrtcSignal,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebRtcMessage {
    #[serde(default)]
    pub subtype: Subtype,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default)]
    pub initiator: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WebRtcMessage {
    /// Call negotiation data; absent or malformed data reads as not accepted.
    pub fn call_data(&self) -> CallData {
        serde_json::from_value(self.data.clone()).unwrap_or_default()
    }
}

/// `data` of `webrtc_call` and `webrtc_hangup` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallData {
    #[serde(default)]
    pub accept: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub state: String,
}

impl CallData {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn decode_text(raw: &str) -> Result<Envelope> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_text(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}
