// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-frame classification.
//!
//! Two shapes travel on a connection: the standard envelope and the custom
//! frame. The discriminator is structural: presence of `message_dim` means
//! standard, a top-level `type` without `message_dim` means custom, and
//! anything else is malformed (logged and skipped by the read loops).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::protocol::Envelope;

/// WebSocket close codes used on the wire.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (authentication failure).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal error.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A non-envelope frame dispatched by its top-level `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
}

impl CustomFrame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload, target_user: None, target_platform: None }
    }
}

/// One classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Standard(Envelope),
    Custom(CustomFrame),
}

impl WireFrame {
    /// Classify one JSON text frame.
    pub fn classify(text: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::MalformedFrame(format!("invalid JSON: {e}")))?;

        let Some(obj) = value.as_object() else {
            return Err(RelayError::MalformedFrame("frame is not a JSON object".to_owned()));
        };

        if obj.contains_key("message_dim") {
            let envelope: Envelope = serde_json::from_value(value)
                .map_err(|e| RelayError::MalformedFrame(format!("bad envelope: {e}")))?;
            return Ok(Self::Standard(envelope));
        }

        if obj.contains_key("type") {
            let custom: CustomFrame = serde_json::from_value(value)
                .map_err(|e| RelayError::MalformedFrame(format!("bad custom frame: {e}")))?;
            return Ok(Self::Custom(custom));
        }

        Err(RelayError::MalformedFrame("neither envelope nor custom frame".to_owned()))
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
