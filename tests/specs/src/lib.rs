// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process harness for end-to-end relay scenarios: a real server on an
//! ephemeral port, plus hook implementations that forward everything they
//! observe onto channels the test can await.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use msgrelay::{
    ConnectMeta, Envelope, MessageInfo, RelayServer, RouteDim, Segment, ServerConfig, ServerHooks,
};
use tokio::sync::mpsc;

/// Server hooks forwarding every inbound envelope (with the metadata of
/// the connection it arrived on) to an unbounded channel.
pub struct RecordingHooks {
    tx: mpsc::UnboundedSender<(ConnectMeta, Envelope)>,
}

impl RecordingHooks {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<(ConnectMeta, Envelope)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ServerHooks for RecordingHooks {
    fn on_message(&self, envelope: Envelope, meta: &ConnectMeta) -> anyhow::Result<()> {
        let _ = self.tx.send((meta.clone(), envelope));
        Ok(())
    }
}

/// Client hooks forwarding every inbound envelope to an unbounded channel.
pub struct ChannelHooks {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelHooks {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl msgrelay::ClientHooks for ChannelHooks {
    fn on_message(&self, envelope: Envelope) -> anyhow::Result<()> {
        let _ = self.tx.send(envelope);
        Ok(())
    }
}

/// A relay server running in-process on an ephemeral port.
pub struct TestRelay {
    pub server: Arc<RelayServer>,
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    pub async fn start(hooks: Arc<dyn ServerHooks>) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let config = ServerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            enable_connection_log: true,
            ..Default::default()
        };
        let server = RelayServer::new(config, hooks);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                let _ = server.serve_on(listener).await;
            }
        });
        Ok(Self { server, addr, task })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shut the server down and wait for the serve task to finish. The
    /// listener is released, so later reconnect attempts are refused.
    pub async fn stop(self) {
        self.server.shutdown();
        let _ = self.task.await;
    }
}

/// Poll until the registry holds exactly `n` connections.
pub async fn wait_for_connections(server: &RelayServer, n: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if server.stats().await.connections == n {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} connections, have {}",
            server.stats().await.connections
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the client pool has exactly `n` connections in `Connected`
/// state.
pub async fn wait_for_active(client: &msgrelay::RelayClient, n: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.get_active_connections().await.len() == n {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} active client connections"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A minimal routable envelope addressed to `(api_key, platform)`.
pub fn envelope_to(api_key: &str, platform: &str) -> Envelope {
    Envelope::new(
        MessageInfo::new("test-origin", uuid::Uuid::new_v4().to_string(), 1_700_000_000.0),
        Segment::text("payload"),
        RouteDim::new(api_key, platform),
    )
}

/// Receive one envelope from a client channel within the timeout.
pub async fn recv_envelope(
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
    timeout: Duration,
) -> Option<Envelope> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Assert a client channel stays silent for the given window.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Envelope>, window: Duration) {
    let received = tokio::time::timeout(window, rx.recv()).await;
    assert!(!matches!(received, Ok(Some(_))), "expected no envelope, received {received:?}");
}
