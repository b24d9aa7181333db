// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-connection supervisor: owns the pool of outbound connections and
//! routes each outgoing envelope onto the best-matching one.
//!
//! Connections are kept in insertion order; when several connections tie on
//! a priority level, the earliest-added one wins.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::client::config::ClientConfig;
use crate::client::connection::{ClientConnection, ConnState};
use crate::handlers::{ClientHooks, CustomContext, CustomHandlers, DefaultHooks};
use crate::protocol::{CustomFrame, Envelope};

/// Introspection view of one pool entry.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub api_key: String,
    pub platform: String,
    pub state: ConnState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Best-match selection over `(api_key, platform)` candidate coordinates,
/// by strict priority: exact match, then api-key match, then platform
/// match. Candidates are in insertion order; the first hit at the winning
/// priority is returned.
pub(crate) fn select_target(
    candidates: &[(String, String)],
    api_key: &str,
    platform: &str,
) -> Option<usize> {
    let mut key_match = None;
    let mut platform_match = None;

    for (idx, (candidate_key, candidate_platform)) in candidates.iter().enumerate() {
        let key_hit = candidate_key == api_key;
        let platform_hit = candidate_platform == platform;
        if key_hit && platform_hit {
            return Some(idx);
        }
        if key_hit && key_match.is_none() {
            key_match = Some(idx);
        }
        if platform_hit && platform_match.is_none() {
            platform_match = Some(idx);
        }
    }

    key_match.or(platform_match)
}

/// The connection pool. Each entry is bound to a distinct
/// `(url, api_key, platform)` configuration and reconnects independently.
pub struct RelayClient {
    hooks: Arc<dyn ClientHooks>,
    custom: Arc<CustomHandlers>,
    connections: RwLock<IndexMap<Uuid, Arc<ClientConnection>>>,
    shutdown: CancellationToken,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(Arc::new(DefaultHooks))
    }
}

impl RelayClient {
    pub fn new(hooks: Arc<dyn ClientHooks>) -> Self {
        Self {
            hooks,
            custom: Arc::new(CustomHandlers::new()),
            connections: RwLock::new(IndexMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a handler for inbound custom frames, shared by every
    /// connection in the pool.
    pub fn register_custom_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &CustomContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.custom.register(kind, handler);
    }

    /// Add a connection to the pool in `Idle` state. Returns its generated
    /// connection id.
    pub async fn add_connection(&self, config: ClientConfig) -> Uuid {
        let id = Uuid::new_v4();
        let conn =
            ClientConnection::new(id, config, Arc::clone(&self.hooks), Arc::clone(&self.custom));
        self.connections.write().await.insert(id, conn);
        id
    }

    /// Start connecting. Idempotent while a connection loop is running.
    pub async fn connect_to(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.get(id).await.ok_or_else(|| anyhow::anyhow!("unknown connection {id}"))?;
        conn.start(&self.shutdown);
        Ok(())
    }

    /// Start every pool entry that is not already running.
    pub async fn connect_all(&self) {
        let conns: Vec<_> = self.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.start(&self.shutdown);
        }
    }

    /// Stop one connection; it stays in the pool and can be reconnected.
    pub async fn disconnect(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.get(id).await.ok_or_else(|| anyhow::anyhow!("unknown connection {id}"))?;
        conn.stop();
        Ok(())
    }

    /// Stop and remove one connection from the pool.
    pub async fn remove_connection(&self, id: Uuid) -> anyhow::Result<()> {
        let removed = self.connections.write().await.shift_remove(&id);
        let conn = removed.ok_or_else(|| anyhow::anyhow!("unknown connection {id}"))?;
        conn.stop();
        Ok(())
    }

    pub async fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().map(|c| info_of(c)).collect()
    }

    /// Pool entries currently in `Connected` state.
    pub async fn get_active_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.state() == ConnState::Connected)
            .map(|c| info_of(c))
            .collect()
    }

    /// Route one envelope onto the best-matching connected pool entry.
    ///
    /// Selection runs against a snapshot of the active connections. A
    /// failed write returns `false` without retrying elsewhere; retry is
    /// the caller's decision.
    pub async fn send_message(&self, envelope: &Envelope) -> bool {
        if self.shutdown.is_cancelled() {
            debug!("send after shutdown rejected");
            return false;
        }

        let active: Vec<Arc<ClientConnection>> = {
            let pool = self.connections.read().await;
            pool.values().filter(|c| c.state() == ConnState::Connected).cloned().collect()
        };
        let coords: Vec<(String, String)> = active
            .iter()
            .map(|c| (c.api_key().to_owned(), c.platform().to_owned()))
            .collect();

        let Some(idx) =
            select_target(&coords, &envelope.message_dim.api_key, &envelope.message_dim.platform)
        else {
            debug!(
                api_key = %envelope.message_dim.api_key,
                platform = %envelope.message_dim.platform,
                "no eligible connection for envelope"
            );
            return false;
        };

        active[idx].send(envelope).await
    }

    /// Send a custom frame on one specific pool connection.
    pub async fn send_custom(&self, id: Uuid, kind: impl Into<String>, payload: Value) -> bool {
        let Some(conn) = self.get(id).await else {
            return false;
        };
        let frame = CustomFrame::new(kind, payload);
        match serde_json::to_string(&frame) {
            Ok(text) => conn.send_text(text).await,
            Err(e) => {
                debug!(connection = %id, err = %e, "custom frame serialization failed");
                false
            }
        }
    }

    /// Cancel every reconnect timer and read loop, then close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let conns: Vec<_> = self.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.stop();
        }
    }

    async fn get(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(&id).cloned()
    }
}

fn info_of(conn: &ClientConnection) -> ConnectionInfo {
    ConnectionInfo {
        id: conn.id(),
        api_key: conn.api_key().to_owned(),
        platform: conn.platform().to_owned(),
        state: conn.state(),
        reconnect_attempts: conn.reconnect_attempts(),
        last_error: conn.last_error(),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
