// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound connection pool: single connections with reconnect, and the
//! supervisor that picks the best-matching connection per envelope.

pub mod config;
pub mod connection;
pub mod supervisor;

pub use config::{ClientConfig, ClientTls};
pub use connection::{ClientConnection, ConnState};
pub use supervisor::{ConnectionInfo, RelayClient};
