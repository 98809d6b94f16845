pub mod calls;
pub mod client;
pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod logging;
pub mod peer;
mod replies;
pub mod telemetry;
pub mod wsproto;

pub use client::RtmClient;
pub use error::{DataError, Result, RtmError};
pub use events::{ConnectionState, Event, PeerEvent, PeerEventKind, StreamEvent};
