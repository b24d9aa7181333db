// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One outbound WebSocket connection: connect, heartbeat, receive pump,
//! serialized sends, and the reconnect schedule.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::config::ClientConfig;
use crate::handlers::{ClientHooks, CustomContext, CustomHandlers};
use crate::protocol::{Envelope, WireFrame};
use crate::tls;

/// Connection lifecycle state. Only `Connected` is eligible for outbound
/// routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Delay before the k-th reconnect attempt: the base delay doubled per
/// failed attempt, capped.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// One message queued for the writer, acknowledged once flushed.
struct Outbound {
    text: String,
    ack: oneshot::Sender<bool>,
}

/// Why the inner connection loop ended.
enum Disconnect {
    Cancelled,
    Lost,
}

/// A single supervised outbound connection. Persists across transient
/// network failures; destroyed only by explicit removal or client shutdown.
pub struct ClientConnection {
    id: Uuid,
    config: ClientConfig,
    hooks: Arc<dyn ClientHooks>,
    custom: Arc<CustomHandlers>,
    state: RwLock<ConnState>,
    last_error: RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    outbound_tx: RwLock<Option<mpsc::UnboundedSender<Outbound>>>,
    cancel: RwLock<Option<CancellationToken>>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: Uuid,
        config: ClientConfig,
        hooks: Arc<dyn ClientHooks>,
        custom: Arc<CustomHandlers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            hooks,
            custom,
            state: RwLock::new(ConnState::Idle),
            last_error: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            outbound_tx: RwLock::new(None),
            cancel: RwLock::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn api_key(&self) -> &str {
        &self.config.api_key
    }

    pub fn platform(&self) -> &str {
        &self.config.platform
    }

    pub fn state(&self) -> ConnState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    fn set_state(&self, next: ConnState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn record_error(&self, err: impl ToString) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) =
            Some(err.to_string());
    }

    /// Start the connection loop. No-op if a loop is already running.
    pub(crate) fn start(self: Arc<Self>, parent: &CancellationToken) {
        if matches!(
            self.state(),
            ConnState::Connecting | ConnState::Connected | ConnState::Reconnecting
        ) {
            return;
        }

        let cancel = parent.child_token();
        *self.cancel.write().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound_tx.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.set_state(ConnState::Connecting);
        tokio::spawn(run_loop(self, cancel, rx));
    }

    /// Stop the connection loop and any pending reconnect timer.
    pub(crate) fn stop(&self) {
        if let Some(cancel) =
            self.cancel.write().unwrap_or_else(PoisonError::into_inner).take()
        {
            cancel.cancel();
        }
        self.outbound_tx.write().unwrap_or_else(PoisonError::into_inner).take();
        self.set_state(ConnState::Stopped);
    }

    /// Serialize and send one envelope. Returns `true` once the frame has
    /// been flushed by the writer.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                warn!(connection = %self.id, err = %e, "envelope serialization failed");
                false
            }
        }
    }

    pub(crate) async fn send_text(&self, text: String) -> bool {
        if self.state() != ConnState::Connected {
            return false;
        }
        let tx = {
            let guard = self.outbound_tx.read().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let Some(tx) = tx else {
            return false;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Outbound { text, ack: ack_tx }).is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }
}

fn build_connector(config: &ClientConfig) -> anyhow::Result<Option<Connector>> {
    if !config.is_secure() {
        return Ok(None);
    }
    match &config.tls {
        // Custom CA / client cert / hostname opt-out.
        Some(tls_opts) => {
            let rustls_config = tls::client_tls_config(tls_opts)?;
            Ok(Some(Connector::Rustls(Arc::new(rustls_config))))
        }
        // Stock connector with native roots.
        None => Ok(None),
    }
}

async fn run_loop(
    conn: Arc<ClientConnection>,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let connector = match build_connector(&conn.config) {
        Ok(c) => c,
        Err(e) => {
            warn!(connection = %conn.id, err = %e, "TLS configuration invalid, stopping");
            conn.record_error(&e);
            conn.set_state(ConnState::Stopped);
            return;
        }
    };

    loop {
        if cancel.is_cancelled() {
            conn.set_state(ConnState::Stopped);
            return;
        }
        conn.set_state(ConnState::Connecting);

        let request = match conn.config.connect_request() {
            Ok(r) => r,
            Err(e) => {
                warn!(connection = %conn.id, err = %e, "connection URL invalid, stopping");
                conn.record_error(&e);
                conn.set_state(ConnState::Stopped);
                return;
            }
        };

        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector.clone());
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                conn.set_state(ConnState::Stopped);
                return;
            }
            result = connect => result,
        };

        match connected {
            Ok((ws, _response)) => {
                conn.reconnect_attempts.store(0, Ordering::Relaxed);
                *conn.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                conn.set_state(ConnState::Connected);
                debug!(connection = %conn.id, url = %conn.config.url, "connected");
                if let Err(e) = conn.hooks.on_connect(conn.id) {
                    warn!(connection = %conn.id, err = %e, "on_connect hook failed");
                }

                let reason = drive(&conn, ws, &cancel, &mut outbound_rx).await;

                if let Err(e) = conn.hooks.on_disconnect(conn.id) {
                    warn!(connection = %conn.id, err = %e, "on_disconnect hook failed");
                }
                if matches!(reason, Disconnect::Cancelled) {
                    conn.set_state(ConnState::Stopped);
                    return;
                }
            }
            Err(e) => {
                debug!(connection = %conn.id, err = %e, "connect failed");
                conn.record_error(&e);
            }
        }

        if !conn.config.auto_reconnect {
            conn.set_state(ConnState::Stopped);
            return;
        }
        let attempt = conn.reconnect_attempts.load(Ordering::Relaxed) + 1;
        if attempt > conn.config.max_reconnect_attempts {
            warn!(
                connection = %conn.id,
                attempts = attempt - 1,
                "reconnect attempts exhausted, stopping"
            );
            conn.set_state(ConnState::Stopped);
            return;
        }
        conn.reconnect_attempts.store(attempt, Ordering::Relaxed);

        conn.set_state(ConnState::Reconnecting);
        let delay = backoff_delay(
            conn.config.reconnect_delay,
            conn.config.max_reconnect_delay,
            attempt,
        );
        debug!(connection = %conn.id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.set_state(ConnState::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn drive(
    conn: &ClientConnection,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cancel: &CancellationToken,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Disconnect {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(conn.config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the interval starts after
    // one full period.
    ping.tick().await;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client shutdown".into(),
                }));
                let _ = tokio::time::timeout(conn.config.close_timeout, write.send(close)).await;
                return Disconnect::Cancelled;
            }

            _ = ping.tick() => {
                if write.send(Message::Ping(Bytes::new())).await.is_err() {
                    conn.record_error("ping write failed");
                    return Disconnect::Lost;
                }
                if pong_deadline.is_none() {
                    pong_deadline =
                        Some(tokio::time::Instant::now() + conn.config.ping_timeout);
                }
            }

            _ = deadline_elapsed(pong_deadline) => {
                warn!(connection = %conn.id, "heartbeat timed out");
                conn.record_error("heartbeat timeout");
                return Disconnect::Lost;
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound { text, ack }) => {
                        let ok = write.send(Message::Text(text.into())).await.is_ok();
                        let _ = ack.send(ok);
                        if !ok {
                            conn.record_error("send failed");
                            return Disconnect::Lost;
                        }
                    }
                    // Sender side dropped: the connection is being removed.
                    None => return Disconnect::Lost,
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_inbound(conn, text.as_str()),
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %conn.id, "server closed connection");
                        conn.record_error("connection closed by peer");
                        return Disconnect::Lost;
                    }
                    Some(Err(e)) => {
                        debug!(connection = %conn.id, err = %e, "read error");
                        conn.record_error(&e);
                        return Disconnect::Lost;
                    }
                    _ => {} // ping/binary ignored
                }
            }
        }
    }
}

/// Decode one inbound frame identically to the server and dispatch it.
fn dispatch_inbound(conn: &ClientConnection, text: &str) {
    match WireFrame::classify(text) {
        Ok(WireFrame::Standard(envelope)) => {
            if let Err(e) = conn.hooks.on_message(envelope) {
                warn!(connection = %conn.id, err = %e, "on_message hook failed");
            }
        }
        Ok(WireFrame::Custom(frame)) => {
            let ctx = CustomContext {
                connection: conn.id,
                api_key: conn.config.api_key.clone(),
                platform: conn.config.platform.clone(),
            };
            conn.custom.dispatch(&frame, &ctx);
        }
        Err(e) => {
            warn!(connection = %conn.id, err = %e, "malformed frame skipped");
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
