// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket upgrade handler and per-connection read loop.
//!
//! Accept pipeline: parse connect metadata (query string, `x-apikey`
//! header), authenticate, extract the user id, mint a connection uuid,
//! register, then pump frames until close or error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::{ConnectMeta, CustomContext};
use crate::protocol::WireFrame;
use crate::registry::ConnectionRecord;
use crate::server::{RelayServer, WsSink};

/// Query parameters for the WS upgrade. The api key may come from the
/// `api_key` query parameter (preferred) or the `x-apikey` header.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub api_key: Option<String>,
    pub platform: Option<String>,
}

fn reject(status: u16, body: &'static str) -> axum::response::Response {
    axum::http::Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_default()
        .into_response()
}

/// WS upgrade for the configured relay path.
pub async fn ws_handler(
    State(server): State<Arc<RelayServer>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let api_key = query
        .api_key
        .filter(|k| !k.is_empty())
        .or_else(|| headers.get("x-apikey").and_then(|v| v.to_str().ok()).map(str::to_owned))
        .unwrap_or_default();
    let platform = query.platform.unwrap_or_default();
    let meta = ConnectMeta { api_key, platform, remote_addr: Some(addr) };

    if server.shutdown.is_cancelled() {
        return reject(503, "shutting down");
    }

    if !server.hooks.authenticate(&meta) {
        debug!(%addr, "handshake rejected: authentication failed");
        return reject(401, "unauthorized");
    }

    let user_id = match server.hooks.extract_user(&meta.api_key) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(%addr, err = %e, "handshake rejected: user extraction failed");
            return reject(403, "forbidden");
        }
    };

    ws.on_upgrade(move |socket| handle_connection(server, socket, meta, user_id)).into_response()
}

/// Per-connection lifecycle: register, pump frames, tear down.
async fn handle_connection(
    server: Arc<RelayServer>,
    socket: WebSocket,
    meta: ConnectMeta,
    user_id: String,
) {
    let uuid = Uuid::new_v4();
    let (ws_tx, mut ws_rx) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(ws_tx));

    let record = ConnectionRecord {
        uuid,
        user_id: user_id.clone(),
        platform: meta.platform.clone(),
        api_key: meta.api_key.clone(),
        remote_addr: meta.remote_addr,
        established_at: Instant::now(),
    };
    server.registry.register(record, sink).await;

    if server.config.enable_connection_log {
        info!(
            %uuid,
            %user_id,
            platform = %meta.platform,
            remote = ?meta.remote_addr,
            "connection registered"
        );
    }
    if let Err(e) = server.hooks.on_connect(uuid, &meta) {
        warn!(%uuid, err = %e, "on_connect hook failed");
    }

    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => break,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&server, uuid, &meta, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%uuid, "peer closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%uuid, err = %e, "read error");
                        break;
                    }
                    _ => {} // ping/pong/binary ignored
                }
            }
        }
    }

    server.teardown(uuid).await;
}

/// Classify and dispatch one inbound text frame. Malformed frames are
/// logged and skipped; the connection stays open.
fn handle_frame(server: &RelayServer, uuid: Uuid, meta: &ConnectMeta, text: &str) {
    match WireFrame::classify(text) {
        Ok(WireFrame::Standard(envelope)) => {
            if server.config.enable_message_log {
                info!(
                    %uuid,
                    message_id = %envelope.message_info.message_id,
                    origin = %envelope.message_info.platform,
                    "envelope received"
                );
            }
            if let Err(e) = server.hooks.on_message(envelope, meta) {
                warn!(%uuid, err = %e, "on_message hook failed");
            }
        }
        Ok(WireFrame::Custom(frame)) => {
            let ctx = CustomContext {
                connection: uuid,
                api_key: meta.api_key.clone(),
                platform: meta.platform.clone(),
            };
            server.custom.dispatch(&frame, &ctx);
        }
        Err(e) => {
            warn!(%uuid, err = %e, "malformed frame skipped");
        }
    }
}
