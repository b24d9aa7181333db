// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end routing scenarios: an in-process server, library clients,
//! and raw tokio-tungstenite connections where the test needs to misbehave.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use msgrelay::{ClientConfig, DefaultHooks, RegistryStats, RelayClient};
use tokio_tungstenite::tungstenite::Message;

use msgrelay_specs::{
    assert_silent, envelope_to, recv_envelope, ChannelHooks, RecordingHooks, TestRelay,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(200);

async fn pooled_client(
    relay: &TestRelay,
    api_key: &str,
    platform: &str,
) -> anyhow::Result<(RelayClient, tokio::sync::mpsc::UnboundedReceiver<msgrelay::Envelope>)> {
    let (hooks, rx) = ChannelHooks::channel();
    let client = RelayClient::new(hooks);
    let id = client.add_connection(ClientConfig::new(relay.ws_url(), api_key, platform)).await;
    client.connect_to(id).await?;
    Ok((client, rx))
}

// S1: one client, one envelope, on_message fires exactly once.
#[tokio::test]
async fn single_client_round_trip() -> anyhow::Result<()> {
    let (hooks, mut server_rx) = RecordingHooks::channel();
    let relay = TestRelay::start(hooks).await?;

    let (client, _client_rx) = pooled_client(&relay, "kA", "wechat").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;
    assert_eq!(relay.server.stats().await, RegistryStats { users: 1, connections: 1 });

    let envelope = envelope_to("kA", "wechat");
    assert!(client.send_message(&envelope).await);

    let (meta, received) = tokio::time::timeout(TIMEOUT, server_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("server hook channel closed"))?;
    assert_eq!(received, envelope);
    assert_eq!(meta.api_key, "kA");
    assert_eq!(meta.platform, "wechat");

    // Exactly once.
    assert!(server_rx.try_recv().is_err());

    client.shutdown().await;
    relay.stop().await;
    Ok(())
}

// S2: routing by (api_key, platform) reaches exactly the matching client.
#[tokio::test]
async fn routing_selects_exactly_the_matching_connection() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    let (client_a, mut rx_a) = pooled_client(&relay, "kA", "wechat").await?;
    let (client_b, mut rx_b) = pooled_client(&relay, "kA", "qq").await?;
    let (client_c, mut rx_c) = pooled_client(&relay, "kB", "wechat").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 3, TIMEOUT).await;
    assert_eq!(relay.server.stats().await, RegistryStats { users: 2, connections: 3 });

    let envelope = envelope_to("kA", "wechat");
    let delivered = relay.server.send_message(&envelope, None).await;
    assert_eq!(delivered.len(), 1);
    assert!(delivered.values().all(|ok| *ok));
    assert_eq!(recv_envelope(&mut rx_a, TIMEOUT).await.as_ref(), Some(&envelope));
    assert_silent(&mut rx_b, SILENCE).await;
    assert_silent(&mut rx_c, SILENCE).await;

    let delivered = relay.server.send_message(&envelope_to("kA", "qq"), None).await;
    assert_eq!(delivered.len(), 1);
    assert!(recv_envelope(&mut rx_b, TIMEOUT).await.is_some());
    assert_silent(&mut rx_a, SILENCE).await;

    let delivered = relay.server.send_message(&envelope_to("kB", "wechat"), None).await;
    assert_eq!(delivered.len(), 1);
    assert!(recv_envelope(&mut rx_c, TIMEOUT).await.is_some());

    // Platform override redirects the lookup without touching the envelope.
    let delivered = relay.server.send_message(&envelope_to("kA", "wechat"), Some("qq")).await;
    assert_eq!(delivered.len(), 1);
    let via_override = recv_envelope(&mut rx_b, TIMEOUT).await.expect("override reaches B");
    assert_eq!(via_override.platform(), "wechat");

    client_a.shutdown().await;
    client_b.shutdown().await;
    client_c.shutdown().await;
    relay.stop().await;
    Ok(())
}

// S3: broadcast reaches everyone; platform filter narrows it.
#[tokio::test]
async fn broadcast_with_and_without_platform_filter() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    let (client_a, mut rx_a) = pooled_client(&relay, "kA", "wechat").await?;
    let (client_b, mut rx_b) = pooled_client(&relay, "kA", "qq").await?;
    let (client_c, mut rx_c) = pooled_client(&relay, "kB", "wechat").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 3, TIMEOUT).await;

    let envelope = envelope_to("ignored", "ignored");
    let delivered = relay.server.broadcast_message(&envelope, None).await;
    assert_eq!(delivered.len(), 3);
    assert!(delivered.values().all(|ok| *ok));
    assert!(recv_envelope(&mut rx_a, TIMEOUT).await.is_some());
    assert!(recv_envelope(&mut rx_b, TIMEOUT).await.is_some());
    assert!(recv_envelope(&mut rx_c, TIMEOUT).await.is_some());

    let delivered = relay.server.broadcast_message(&envelope, Some("wechat")).await;
    assert_eq!(delivered.len(), 2);
    assert!(recv_envelope(&mut rx_a, TIMEOUT).await.is_some());
    assert!(recv_envelope(&mut rx_c, TIMEOUT).await.is_some());
    assert_silent(&mut rx_b, SILENCE).await;

    client_a.shutdown().await;
    client_b.shutdown().await;
    client_c.shutdown().await;
    relay.stop().await;
    Ok(())
}

// S6: an envelope with an empty routing dimension is dropped with an
// empty result and no frame on the wire.
#[tokio::test]
async fn empty_routing_dimension_is_dropped() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;
    let (client, mut rx) = pooled_client(&relay, "kA", "wechat").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;

    let delivered = relay.server.send_message(&envelope_to("", "wechat"), None).await;
    assert!(delivered.is_empty());
    let delivered = relay.server.send_message(&envelope_to("kA", ""), None).await;
    assert!(delivered.is_empty());
    assert_silent(&mut rx, SILENCE).await;

    client.shutdown().await;
    relay.stop().await;
    Ok(())
}

// Auth failure is rejected at the handshake; the registry never sees it.
#[tokio::test]
async fn missing_api_key_is_rejected_at_handshake() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    let url = format!("ws://{}/ws?platform=wechat", relay.addr);
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
    assert_eq!(relay.server.stats().await, RegistryStats { users: 0, connections: 0 });

    relay.stop().await;
    Ok(())
}

// The api key is also accepted from the x-apikey header alone.
#[tokio::test]
async fn api_key_header_alternative_is_accepted() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request =
        format!("ws://{}/ws?platform=wechat", relay.addr).into_client_request()?;
    request.headers_mut().insert("x-apikey", "kHeader".parse()?);
    let (_ws, _resp) = tokio_tungstenite::connect_async(request).await?;

    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;
    let delivered = relay.server.send_message(&envelope_to("kHeader", "wechat"), None).await;
    assert_eq!(delivered.len(), 1);

    relay.stop().await;
    Ok(())
}

// Malformed frames are logged and skipped; the connection stays open.
#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() -> anyhow::Result<()> {
    let (hooks, mut server_rx) = RecordingHooks::channel();
    let relay = TestRelay::start(hooks).await?;

    let url = format!("ws://{}/ws?api_key=kA&platform=wechat", relay.addr);
    let (mut ws, _resp) = tokio_tungstenite::connect_async(&url).await?;
    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;

    ws.send(Message::Text("{not json".into())).await?;
    ws.send(Message::Text("[1,2,3]".into())).await?;

    let envelope = envelope_to("kA", "wechat");
    ws.send(Message::Text(serde_json::to_string(&envelope)?.into())).await?;

    let (_meta, received) = tokio::time::timeout(TIMEOUT, server_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("server hook channel closed"))?;
    assert_eq!(received, envelope);
    assert_eq!(relay.server.stats().await.connections, 1);

    relay.stop().await;
    Ok(())
}

// Custom frames dispatch by type tag on both sides.
#[tokio::test]
async fn custom_frames_dispatch_on_both_sides() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    relay.server.register_custom_handler("presence", move |payload, ctx| {
        let _ = seen_tx.send((payload.clone(), ctx.api_key.clone()));
        Ok(())
    });

    let (hooks, _rx) = ChannelHooks::channel();
    let client = RelayClient::new(hooks);
    let (custom_tx, mut custom_rx) = tokio::sync::mpsc::unbounded_channel();
    client.register_custom_handler("roster", move |payload, _ctx| {
        let _ = custom_tx.send(payload.clone());
        Ok(())
    });

    let id = client.add_connection(ClientConfig::new(relay.ws_url(), "kA", "wechat")).await;
    client.connect_to(id).await?;
    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;
    msgrelay_specs::wait_for_active(&client, 1, TIMEOUT).await;

    // Client -> server.
    assert!(client.send_custom(id, "presence", serde_json::json!({"online": true})).await);
    let (payload, api_key) = tokio::time::timeout(TIMEOUT, seen_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("server custom channel closed"))?;
    assert_eq!(payload["online"], serde_json::json!(true));
    assert_eq!(api_key, "kA");

    // Server -> client, targeted at the user's platform.
    let delivered = relay
        .server
        .send_custom_message("roster", serde_json::json!(["alice"]), Some("kA"), Some("wechat"))
        .await;
    assert_eq!(delivered.len(), 1);
    let payload = tokio::time::timeout(TIMEOUT, custom_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("client custom channel closed"))?;
    assert_eq!(payload, serde_json::json!(["alice"]));

    // Omitted targets broadcast across the omitted dimension.
    let delivered =
        relay.server.send_custom_message("roster", serde_json::json!([]), None, None).await;
    assert_eq!(delivered.len(), 1);

    client.shutdown().await;
    relay.stop().await;
    Ok(())
}

// The health and stats endpoints sit next to the WS route.
#[tokio::test]
async fn health_and_stats_endpoints() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;
    let (client, _rx) = pooled_client(&relay, "kA", "wechat").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 1, TIMEOUT).await;

    let health: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", relay.http_url())).await?.json().await?;
    assert_eq!(health["status"], "running");

    let stats: serde_json::Value =
        reqwest::get(format!("{}/api/v1/stats", relay.http_url())).await?.json().await?;
    assert_eq!(stats["users"], 1);
    assert_eq!(stats["connections"], 1);
    assert_eq!(stats["platforms"]["wechat"], 1);

    client.shutdown().await;
    relay.stop().await;
    Ok(())
}

// P6: once every socket is gone, no dangling registry entries remain.
#[tokio::test]
async fn registry_drains_after_all_disconnects() -> anyhow::Result<()> {
    let relay = TestRelay::start(Arc::new(DefaultHooks)).await?;

    let (client_a, _rx_a) = pooled_client(&relay, "kA", "wechat").await?;
    let (client_b, _rx_b) = pooled_client(&relay, "kA", "qq").await?;
    msgrelay_specs::wait_for_connections(&relay.server, 2, TIMEOUT).await;

    client_a.shutdown().await;
    client_b.shutdown().await;
    msgrelay_specs::wait_for_connections(&relay.server, 0, TIMEOUT).await;
    assert_eq!(relay.server.stats().await, RegistryStats { users: 0, connections: 0 });

    relay.stop().await;
    Ok(())
}
