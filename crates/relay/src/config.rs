// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay server.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "MSGRELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 18040, env = "MSGRELAY_PORT")]
    pub port: u16,

    /// URL path serving the WebSocket upgrade.
    #[arg(long, default_value = "/ws", env = "MSGRELAY_PATH")]
    pub path: String,

    /// Serve TLS (wss://). Requires --ssl-certfile and --ssl-keyfile.
    #[arg(long, env = "MSGRELAY_SSL_ENABLED")]
    pub ssl_enabled: bool,

    /// PEM certificate chain presented to clients.
    #[arg(long, env = "MSGRELAY_SSL_CERTFILE")]
    pub ssl_certfile: Option<PathBuf>,

    /// PEM private key for the certificate.
    #[arg(long, env = "MSGRELAY_SSL_KEYFILE")]
    pub ssl_keyfile: Option<PathBuf>,

    /// PEM CA bundle used to verify client certificates.
    #[arg(long, env = "MSGRELAY_SSL_CA_CERTS")]
    pub ssl_ca_certs: Option<PathBuf>,

    /// Require and verify client certificates against the CA bundle.
    #[arg(long, env = "MSGRELAY_SSL_VERIFY")]
    pub ssl_verify: bool,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info", env = "MSGRELAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log connection registration and teardown.
    #[arg(long, env = "MSGRELAY_CONNECTION_LOG")]
    pub enable_connection_log: bool,

    /// Log every routed envelope.
    #[arg(long, env = "MSGRELAY_MESSAGE_LOG")]
    pub enable_message_log: bool,

    /// Periodically log registry gauges.
    #[arg(long, env = "MSGRELAY_STATS")]
    pub enable_stats: bool,

    /// Stats logging interval in milliseconds.
    #[arg(long, default_value_t = 30000, env = "MSGRELAY_STATS_INTERVAL_MS")]
    pub stats_interval_ms: u64,

    /// Bound on draining in-flight sends at shutdown, in milliseconds.
    #[arg(long, default_value_t = 5000, env = "MSGRELAY_CLOSE_TIMEOUT_MS")]
    pub close_timeout_ms: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 18040,
            path: "/ws".to_owned(),
            ssl_enabled: false,
            ssl_certfile: None,
            ssl_keyfile: None,
            ssl_ca_certs: None,
            ssl_verify: false,
            log_level: "info".to_owned(),
            enable_connection_log: false,
            enable_message_log: false,
            enable_stats: false,
            stats_interval_ms: 30000,
            close_timeout_ms: 5000,
        }
    }
}
