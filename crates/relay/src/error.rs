// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the relay.
//!
//! Transport and malformed-frame errors are recovered locally; configuration
//! errors are fatal at startup (propagated via `anyhow`); application
//! callback errors are logged at the dispatch boundary and never reach the
//! registry or the peer.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Auth predicate returned false or the user extractor failed; the
    /// handshake is rejected before a connection record exists.
    HandshakeRejected,
    /// JSON parse or shape check failed. The connection stays open.
    MalformedFrame(String),
    /// Missing routing dimensions or no matching live connection.
    UnroutableEnvelope(String),
    /// Read or write failed mid-session.
    Transport(String),
    /// An application hook failed.
    Callback(String),
    /// A send was attempted after shutdown was requested.
    ShutdownInProgress,
}

impl RelayError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandshakeRejected => "HANDSHAKE_REJECTED",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::UnroutableEnvelope(_) => "UNROUTABLE_ENVELOPE",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Callback(_) => "CALLBACK_ERROR",
            Self::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(detail)
            | Self::UnroutableEnvelope(detail)
            | Self::Transport(detail)
            | Self::Callback(detail) => write!(f, "{}: {detail}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for RelayError {}
