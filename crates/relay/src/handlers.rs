// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Application hook points and the custom-frame dispatch table.
//!
//! All hook points live on a single trait passed at construction, with a
//! trivial default implementation. Hook failures are caught at the dispatch
//! boundary, logged with connection context, and never propagate to the
//! registry or the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{CustomFrame, Envelope};

/// Connect-time metadata derived from the upgrade request
/// (query string + headers).
#[derive(Debug, Clone)]
pub struct ConnectMeta {
    pub api_key: String,
    pub platform: String,
    pub remote_addr: Option<SocketAddr>,
}

/// Server-side hook points.
///
/// `authenticate` and `extract_user` are synchronous predicates over the
/// connect-time metadata; the remaining hooks observe the connection
/// lifecycle. Implementations needing async work should hand off to a task.
pub trait ServerHooks: Send + Sync + 'static {
    /// Validate connect-time credentials. The default accepts any metadata
    /// carrying a non-empty `api_key`.
    fn authenticate(&self, meta: &ConnectMeta) -> bool {
        !meta.api_key.is_empty()
    }

    /// Derive the stable user identifier a connection is registered under.
    /// The default returns the api_key verbatim; an implementation may
    /// collapse many api_keys onto one user.
    fn extract_user(&self, api_key: &str) -> anyhow::Result<String> {
        Ok(api_key.to_owned())
    }

    fn on_connect(&self, _uuid: Uuid, _meta: &ConnectMeta) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for every inbound standard envelope. The server does not
    /// auto-forward; re-routing via `send_message` is this hook's decision.
    fn on_message(&self, _envelope: Envelope, _meta: &ConnectMeta) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _uuid: Uuid, _meta: &ConnectMeta) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Client-side hook points, one set per [`crate::client::RelayClient`].
pub trait ClientHooks: Send + Sync + 'static {
    /// Called for every inbound standard envelope.
    fn on_message(&self, _envelope: Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_connect(&self, _connection_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _connection_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Trivial hook implementation; every hook is a no-op with the documented
/// default behavior.
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}
impl ClientHooks for DefaultHooks {}

/// Context handed to a custom handler alongside the payload: the connection
/// the frame arrived on and its routing coordinates.
#[derive(Debug, Clone)]
pub struct CustomContext {
    pub connection: Uuid,
    pub api_key: String,
    pub platform: String,
}

type CustomHandler = Arc<dyn Fn(&Value, &CustomContext) -> anyhow::Result<()> + Send + Sync>;

/// Type-keyed dispatch table for custom frames.
///
/// Read-mostly; handlers may be registered at any time. Unknown types are
/// logged and dropped, handler failures are logged and isolated.
#[derive(Default)]
pub struct CustomHandlers {
    table: RwLock<HashMap<String, CustomHandler>>,
}

impl CustomHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &CustomContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.insert(kind.into(), Arc::new(handler));
    }

    /// Dispatch one custom frame. Never fails from the caller's view.
    pub fn dispatch(&self, frame: &CustomFrame, ctx: &CustomContext) {
        let handler = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table.get(&frame.kind).cloned()
        };

        match handler {
            Some(handler) => {
                if let Err(e) = handler(&frame.payload, ctx) {
                    tracing::warn!(
                        kind = %frame.kind,
                        connection = %ctx.connection,
                        err = %e,
                        "custom handler failed"
                    );
                }
            }
            None => {
                tracing::debug!(
                    kind = %frame.kind,
                    connection = %ctx.connection,
                    "no handler registered for custom frame, dropping"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
