// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The relay server: WS listener, routing sends, broadcast, and shutdown.

pub mod ws;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::handlers::{ConnectMeta, CustomContext, CustomHandlers, ServerHooks};
use crate::protocol::{close_code, CustomFrame, Envelope};
use crate::registry::{ConnectionRecord, Registry, RegistryStats};
use crate::tls;

/// The write half of one accepted socket. Exactly one writer at a time;
/// senders serialize on the mutex and never hold the registry lock while
/// writing.
pub type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Per-recipient delivery outcome of one send or broadcast.
pub type DeliveryMap = HashMap<Uuid, bool>;

/// A running relay server instance.
pub struct RelayServer {
    pub(crate) config: ServerConfig,
    pub(crate) hooks: Arc<dyn ServerHooks>,
    pub(crate) custom: CustomHandlers,
    pub(crate) registry: Registry<WsSink>,
    pub(crate) shutdown: CancellationToken,
    started_at: Instant,
}

impl RelayServer {
    pub fn new(config: ServerConfig, hooks: Arc<dyn ServerHooks>) -> Arc<Self> {
        Arc::new(Self {
            config,
            hooks,
            custom: CustomHandlers::new(),
            registry: Registry::new(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown: the accept loop stops, read tasks are cancelled,
    /// in-flight sends drain bounded by `close_timeout`, and sockets close
    /// with status 1001.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn register_custom_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &CustomContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.custom.register(kind, handler);
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Bind and serve until shutdown.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(%addr, path = %self.config.path, ssl = self.config.ssl_enabled, "msgrelay listening");
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.config.path.starts_with('/'),
            "WS path must start with '/': {}",
            self.config.path
        );

        if self.config.enable_stats {
            spawn_stats_logger(Arc::clone(&self));
        }

        // Close registered sockets as soon as shutdown fires, so read tasks
        // end and graceful shutdown can complete.
        let closer = tokio::spawn({
            let server = Arc::clone(&self);
            async move {
                server.shutdown.cancelled().await;
                server.close_all().await;
            }
        });

        let router = build_router(Arc::clone(&self));
        let served = if self.config.ssl_enabled {
            match tls::server_tls_config(&self.config) {
                Ok(tls_config) => {
                    tls::serve_tls(listener, Arc::new(tls_config), router, self.shutdown.clone())
                        .await
                }
                Err(e) => Err(e),
            }
        } else {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
                .await
                .map_err(anyhow::Error::from)
        };

        // Unblock the closer if serving ended without a shutdown request.
        self.shutdown.cancel();
        let _ = closer.await;
        served
    }

    /// Route one envelope to every live connection matching its routing
    /// dimensions (platform optionally overridden). Returns per-uuid
    /// delivery outcomes; an empty map means the envelope was unroutable
    /// or matched nothing.
    pub async fn send_message(
        &self,
        envelope: &Envelope,
        platform_override: Option<&str>,
    ) -> DeliveryMap {
        if self.shutdown.is_cancelled() {
            warn!(error = %RelayError::ShutdownInProgress, "send_message rejected");
            return DeliveryMap::new();
        }

        let api_key = envelope.api_key();
        let platform = platform_override.unwrap_or_else(|| envelope.platform());
        if api_key.is_empty() || platform.is_empty() {
            warn!(
                error = %RelayError::UnroutableEnvelope("empty routing dimension".to_owned()),
                "dropping envelope"
            );
            return DeliveryMap::new();
        }

        let user_id = match self.hooks.extract_user(api_key) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!(err = %e, "user extraction failed, dropping envelope");
                return DeliveryMap::new();
            }
        };

        let targets = self.registry.lookup(&user_id, platform).await;
        if targets.is_empty() {
            debug!(%user_id, %platform, "no matching connection, dropping envelope");
            return DeliveryMap::new();
        }

        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "envelope serialization failed");
                return DeliveryMap::new();
            }
        };

        if self.config.enable_message_log {
            info!(
                %user_id,
                %platform,
                message_id = %envelope.message_info.message_id,
                recipients = targets.len(),
                "routing envelope"
            );
        }

        self.fan_out(targets, text).await
    }

    /// Send a custom frame. An omitted target broadcasts across that
    /// dimension: all platforms of the user, all users on the platform, or
    /// every connection when both are omitted.
    pub async fn send_custom_message(
        &self,
        kind: impl Into<String>,
        payload: Value,
        target_user: Option<&str>,
        target_platform: Option<&str>,
    ) -> DeliveryMap {
        if self.shutdown.is_cancelled() {
            warn!(error = %RelayError::ShutdownInProgress, "send_custom_message rejected");
            return DeliveryMap::new();
        }

        let frame = CustomFrame {
            kind: kind.into(),
            payload,
            target_user: target_user.map(str::to_owned),
            target_platform: target_platform.map(str::to_owned),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "custom frame serialization failed");
                return DeliveryMap::new();
            }
        };

        let targets: Vec<(Uuid, WsSink)> = self
            .registry
            .snapshot_all()
            .await
            .into_iter()
            .filter(|conn| target_user.is_none_or(|u| conn.user_id == u))
            .filter(|conn| target_platform.is_none_or(|p| conn.platform == p))
            .map(|conn| (conn.uuid, conn.sender))
            .collect();

        self.fan_out(targets, text).await
    }

    /// Fan out to every live connection, optionally filtered by platform,
    /// independent of the envelope's routing dimensions.
    pub async fn broadcast_message(
        &self,
        envelope: &Envelope,
        platform: Option<&str>,
    ) -> DeliveryMap {
        if self.shutdown.is_cancelled() {
            warn!(error = %RelayError::ShutdownInProgress, "broadcast_message rejected");
            return DeliveryMap::new();
        }

        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "envelope serialization failed");
                return DeliveryMap::new();
            }
        };

        let targets: Vec<(Uuid, WsSink)> = self
            .registry
            .snapshot_all()
            .await
            .into_iter()
            .filter(|conn| platform.is_none_or(|p| conn.platform == p))
            .map(|conn| (conn.uuid, conn.sender))
            .collect();

        self.fan_out(targets, text).await
    }

    /// Write the serialized frame on every target socket in parallel.
    /// Individual failures record `false` and unregister the dead socket;
    /// other recipients are unaffected.
    async fn fan_out(&self, targets: Vec<(Uuid, WsSink)>, text: String) -> DeliveryMap {
        let sends = targets.into_iter().map(|(uuid, sink)| {
            let text = text.clone();
            async move {
                let mut sink = sink.lock().await;
                let ok = sink.send(Message::Text(text.into())).await.is_ok();
                (uuid, ok)
            }
        });
        let outcomes = futures_util::future::join_all(sends).await;

        let mut delivered = DeliveryMap::with_capacity(outcomes.len());
        for (uuid, ok) in outcomes {
            if !ok {
                debug!(%uuid, "write failed, unregistering dead socket");
                self.teardown(uuid).await;
            }
            delivered.insert(uuid, ok);
        }
        delivered
    }

    /// Remove one connection from the registry and fire `on_disconnect`.
    /// Safe to call from both the read loop and failed senders; only the
    /// call that actually removed the record fires the hook.
    pub(crate) async fn teardown(&self, uuid: Uuid) {
        let Some(record) = self.registry.unregister(uuid).await else {
            return;
        };
        if self.config.enable_connection_log {
            info!(
                %uuid,
                user_id = %record.user_id,
                platform = %record.platform,
                "connection closed"
            );
        }
        let meta = meta_of(&record);
        if let Err(e) = self.hooks.on_disconnect(uuid, &meta) {
            warn!(%uuid, err = %e, "on_disconnect hook failed");
        }
    }

    /// Send a going-away close on every live socket, bounded by
    /// `close_timeout`, then drop the registry entries.
    async fn close_all(&self) {
        let targets = self.registry.snapshot_all().await;
        if targets.is_empty() {
            return;
        }
        debug!(connections = targets.len(), "closing all connections");

        let closes = targets.iter().map(|conn| {
            let sink = Arc::clone(&conn.sender);
            async move {
                let close = Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: close_code::GOING_AWAY,
                    reason: "server shutting down".into(),
                }));
                let _ = sink.lock().await.send(close).await;
            }
        });
        let _ = tokio::time::timeout(
            self.config.close_timeout(),
            futures_util::future::join_all(closes),
        )
        .await;

        for conn in targets {
            self.teardown(conn.uuid).await;
        }
    }
}

/// Build the axum `Router`: the configured WS route plus the health/stats
/// surface.
pub fn build_router(server: Arc<RelayServer>) -> Router {
    Router::new()
        .route(&server.config.path, get(ws::ws_handler))
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(server)
}

pub(crate) fn meta_of(record: &ConnectionRecord) -> ConnectMeta {
    ConnectMeta {
        api_key: record.api_key.clone(),
        platform: record.platform.clone(),
        remote_addr: record.remote_addr,
    }
}

// -- HTTP surface -------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health(State(server): State<Arc<RelayServer>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "running", uptime_secs: server.started_at.elapsed().as_secs() })
}

#[derive(Serialize)]
struct StatsResponse {
    users: usize,
    connections: usize,
    platforms: HashMap<String, usize>,
}

async fn stats_endpoint(State(server): State<Arc<RelayServer>>) -> Json<StatsResponse> {
    let stats = server.registry.stats().await;
    let mut platforms: HashMap<String, usize> = HashMap::new();
    for conn in server.registry.snapshot_all().await {
        *platforms.entry(conn.platform).or_default() += 1;
    }
    Json(StatsResponse { users: stats.users, connections: stats.connections, platforms })
}

/// Periodically log registry gauges until shutdown.
fn spawn_stats_logger(server: Arc<RelayServer>) {
    tokio::spawn(async move {
        let interval = server.config.stats_interval();
        loop {
            tokio::select! {
                _ = server.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let stats = server.registry.stats().await;
                    info!(users = stats.users, connections = stats.connections, "registry stats");
                }
            }
        }
    });
}
