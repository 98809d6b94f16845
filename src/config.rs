use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub server_url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub ws_subprotocol: Option<String>,
    #[serde(default)]
    pub options: Options,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

// Manual Debug impl so tokens never end up in logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("user", &self.user)
            .field("auth_type", &self.auth_type)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[redacted]"))
            .field("ice_servers", &self.ice_servers)
            .field("ws_subprotocol", &self.ws_subprotocol)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    Token,
    Bearer,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Token => "Token",
            AuthType::Bearer => "Bearer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![DEFAULT_STUN_SERVER.to_string()],
        username: None,
        credential: None,
    }]
}

/// Timing and reconnect knobs. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_enabled: bool,
    pub reconnect_interval_ms: u64,
    pub reconnect_factor: f64,
    pub max_reconnect_interval_ms: u64,
    pub reconnect_spreader_ms: u64,
    pub call_reply_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 5000,
            reconnect_enabled: true,
            reconnect_interval_ms: 1000,
            reconnect_factor: 1.5,
            max_reconnect_interval_ms: 30000,
            reconnect_spreader_ms: 500,
            call_reply_timeout_ms: 5000,
        }
    }
}

impl Options {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pongs must arrive within 90% of the heartbeat interval.
    pub fn heartbeat_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(9) / 10)
    }

    pub fn call_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.call_reply_timeout_ms)
    }

    /// Backoff before reconnect attempt number `attempts`, without jitter:
    /// `min(max_interval, interval * factor^attempts)`.
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.min(1024) as i32;
        let raw = self.reconnect_interval_ms as f64 * self.reconnect_factor.powi(exp);
        let capped = raw.min(self.max_reconnect_interval_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn reconnect_jitter(&self) -> Duration {
        if self.reconnect_spreader_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..self.reconnect_spreader_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be positive");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be positive");
        }
        if self.reconnect_factor.is_nan() || self.reconnect_factor < 1.0 {
            anyhow::bail!("reconnect_factor must be >= 1.0");
        }
        Ok(())
    }
}

impl Config {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut cfg = Config {
            server_url: server_url.to_string(),
            user: None,
            auth_type: None,
            auth_token: None,
            ice_servers: default_ice_servers(),
            ws_subprotocol: None,
            options: Options::default(),
            config_path: None,
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_auth(mut self, auth_type: AuthType, token: &str) -> Self {
        self.auth_type = Some(auth_type);
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    fn normalize(&mut self) -> Result<()> {
        let trimmed = self.server_url.trim().trim_end_matches('/');
        // Socket URLs are accepted but the handshake speaks HTTP.
        self.server_url = if let Some(rest) = trimmed.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            trimmed.to_string()
        };
        if self.user.as_deref().is_some_and(|u| u.trim().is_empty()) {
            self.user = None;
        }
        if self.auth_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.auth_token = None;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        if self.auth_token.is_some() && self.auth_type.is_none() {
            anyhow::bail!("auth_token requires auth_type");
        }
        self.options.validate().context("options")?;
        Ok(())
    }
}

pub fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub fn default_log_file_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".rtm-client").join("logs").join("rtm-client.log")
}
