// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The routed message envelope and its descriptor records.
//!
//! Field names are wire-format verbatim: one JSON document per WebSocket
//! text frame. Every record carries a flattened `extra` map so fields added
//! by newer peers survive a decode/encode round-trip unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing dimensions naming the **recipient** of an envelope.
///
/// Both fields must be non-empty for the envelope to be routable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDim {
    pub api_key: String,
    pub platform: String,
}

impl RouteDim {
    pub fn new(api_key: impl Into<String>, platform: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), platform: platform.into() }
    }
}

/// Sender descriptor. The relay never inspects this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_cardname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Group descriptor. The relay never inspects this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Declared content/accept formats for the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_format: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accept_format: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Descriptive metadata for one envelope. The routing layer does not
/// inspect any of these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Platform tag of the message **origin** (distinct from the routing
    /// target in [`RouteDim`]).
    pub platform: String,
    pub message_id: String,
    /// Unix timestamp in seconds; may be fractional.
    pub time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_info: Option<SenderInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_info: Option<FormatInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageInfo {
    pub fn new(platform: impl Into<String>, message_id: impl Into<String>, time: f64) -> Self {
        Self {
            platform: platform.into(),
            message_id: message_id.into(),
            time,
            sender_info: None,
            group_info: None,
            format_info: None,
            extra: Map::new(),
        }
    }
}

/// The payload: a typed tag plus opaque data. A segment may nest (a
/// `seglist` segment's `data` is an array of segments), but the relay
/// treats `data` as an opaque [`Value`] throughout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Segment {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data, extra: Map::new() }
    }

    /// Plain text payload.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new("text", Value::String(content.into()))
    }
}

/// The unit of routed traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_info: MessageInfo,
    pub message_segment: Segment,
    pub message_dim: RouteDim,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(message_info: MessageInfo, message_segment: Segment, message_dim: RouteDim) -> Self {
        Self { message_info, message_segment, message_dim, extra: Map::new() }
    }

    /// The recipient api_key routing dimension.
    pub fn api_key(&self) -> &str {
        &self.message_dim.api_key
    }

    /// The recipient platform routing dimension.
    pub fn platform(&self) -> &str {
        &self.message_dim.platform
    }

    /// Whether both routing dimensions are non-empty.
    pub fn is_routable(&self) -> bool {
        !self.message_dim.api_key.is_empty() && !self.message_dim.platform.is_empty()
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
