// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! msgrelay: WebSocket envelope routing between identified endpoints.
//!
//! A server indexes authenticated connections by `(user, platform,
//! connection uuid)` and routes each outbound envelope to the matching
//! subset; a companion client supervises a pool of outbound connections and
//! picks the best match per envelope. Delivery is best-effort and
//! in-memory: no queues, no replay, no cross-server federation.

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tls;

use std::sync::Arc;

pub use client::{ClientConfig, ClientTls, ConnState, ConnectionInfo, RelayClient};
pub use config::ServerConfig;
pub use error::RelayError;
pub use handlers::{ClientHooks, ConnectMeta, CustomContext, DefaultHooks, ServerHooks};
pub use protocol::{CustomFrame, Envelope, MessageInfo, RouteDim, Segment, WireFrame};
pub use registry::RegistryStats;
pub use server::{DeliveryMap, RelayServer};

/// Run a relay server with default hooks until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = RelayServer::new(config, Arc::new(DefaultHooks));
    server.serve().await
}
