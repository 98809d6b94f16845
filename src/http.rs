use std::time::Duration;

use reqwest::{header, Client as HttpClient, ClientBuilder, Response};
use serde::Deserialize;
use url::Url;

use crate::error::{DataError, Result, RtmError};

const CONNECT_PATH: &str = "/api/v1/rtm.connect";

#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
}

/// Body of `rtm.connect`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<DataError>,
}

impl ConnectResponse {
    fn http_error(resp: &Response) -> Self {
        let status = resp.status();
        ConnectResponse {
            ok: false,
            url: None,
            error: Some(DataError::new(
                format!("http_error_{}", status.as_u16()),
                status.canonical_reason().unwrap_or_default(),
            )),
        }
    }

    /// Socket URL on success, the server's error otherwise.
    pub fn into_url(self) -> Result<String> {
        match (self.ok, self.url) {
            (true, Some(url)) if !url.is_empty() => Ok(url),
            _ => Err(RtmError::Data(
                self.error
                    .unwrap_or_else(|| DataError::new("unknown_error", "")),
            )),
        }
    }
}

impl ApiClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("rtm-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Asks the server for a socket URL for `user`.
    ///
    /// Non-2xx statuses are folded into an `http_error_<status>` response so
    /// the caller only has to look at one shape.
    pub async fn rtm_connect(
        &self,
        user: &str,
        authorization: Option<&str>,
    ) -> Result<ConnectResponse> {
        let url = format!("{}{}", self.base, CONNECT_PATH);
        let mut req = self.http.post(url).form(&[("user", user)]);
        if let Some(value) = authorization {
            req = req.header(header::AUTHORIZATION, value);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Ok(ConnectResponse::http_error(&resp));
        }
        Ok(resp.json::<ConnectResponse>().await?)
    }

    /// Absolute socket URL for a handshake result, with `http(s)` swapped for
    /// `ws(s)`.
    pub fn socket_url(&self, url: &str) -> Result<Url> {
        let absolute = if url.contains("://") {
            url.to_string()
        } else {
            format!("{}{}", self.base, url)
        };
        let rewritten = if let Some(rest) = strip_prefix_ci(&absolute, "https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = strip_prefix_ci(&absolute, "http://") {
            format!("ws://{rest}")
        } else {
            absolute
        };
        Ok(Url::parse(&rewritten)?)
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}
