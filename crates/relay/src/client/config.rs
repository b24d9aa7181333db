// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio_tungstenite::tungstenite;

/// Client-side TLS mirror options. Only needed for a custom CA bundle, a
/// client certificate, or hostname-verification opt-out; plain `wss://`
/// URLs use the platform trust store without any of this.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub ca_certs: Option<PathBuf>,
    pub check_hostname: bool,
}

impl Default for ClientTls {
    fn default() -> Self {
        Self { certfile: None, keyfile: None, ca_certs: None, check_hostname: true }
    }
}

/// Configuration for one outbound connection, bound to a fixed
/// `(url, api_key, platform)`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the relay endpoint.
    pub url: String,
    pub api_key: String,
    pub platform: String,

    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,

    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub close_timeout: Duration,

    pub tls: Option<ClientTls>,
}

impl ClientConfig {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            platform: platform.into(),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            tls: None,
        }
    }

    /// Build from host/port/path parts instead of a full URL.
    pub fn from_parts(
        host: &str,
        port: u16,
        path: &str,
        ssl: bool,
        api_key: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        let scheme = if ssl { "wss" } else { "ws" };
        let path = if path.starts_with('/') { path.to_owned() } else { format!("/{path}") };
        Self::new(format!("{scheme}://{host}:{port}{path}"), api_key, platform)
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max_delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Whether the URL implies TLS.
    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }

    /// Build the upgrade request: routing coordinates in the query string,
    /// api key mirrored in the `x-apikey` header.
    pub(crate) fn connect_request(&self) -> anyhow::Result<tungstenite::handshake::client::Request> {
        use tungstenite::client::IntoClientRequest;

        let sep = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{sep}api_key={}&platform={}", self.url, self.api_key, self.platform);
        let mut request = url.into_client_request().context("invalid connection URL")?;
        request.headers_mut().insert(
            "x-apikey",
            tungstenite::http::HeaderValue::from_str(&self.api_key)
                .context("api_key is not a valid header value")?,
        );
        Ok(request)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
