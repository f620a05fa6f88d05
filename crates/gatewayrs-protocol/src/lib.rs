//! Wire-protocol boundary types.
//!
//! Protocol conversion between the Anthropic/OpenAI/Gemini wire formats is
//! explicitly out of scope for this crate (see the gateway's top-level
//! design notes) — a full transform layer, analogous to the teacher's
//! `gproxy-transform`, would implement [`ProtocolConverter`]. This crate
//! intentionally does **not** depend on axum or any concrete HTTP client;
//! it only carries the DTOs the scheduler and pipeline need to reason about
//! a request without parsing its body.

pub mod wire;

pub use wire::{
    HttpMethod, ProtocolConverter, ProtocolError, UpstreamHttpRequest, UpstreamHttpResponse,
};

use serde::{Deserialize, Serialize};

/// A minimally-parsed inbound request: enough for the scheduler and
/// pipeline to make routing decisions without understanding the full wire
/// shape of any particular provider.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub family: gatewayrs_common::Family,
    pub model: String,
    pub stream: bool,
    pub session_id: Option<String>,
    /// Raw request body, opaque to everything except the protocol converter.
    pub body: bytes::Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    ServerSentEvents,
    Json,
}
