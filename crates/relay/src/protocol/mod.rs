// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-wire message model: the routed envelope and frame classification.

pub mod envelope;
pub mod frame;

pub use envelope::{Envelope, FormatInfo, GroupInfo, MessageInfo, RouteDim, Segment, SenderInfo};
pub use frame::{close_code, CustomFrame, WireFrame};
