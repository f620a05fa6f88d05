//! Outbound upstream request/response shapes, mirroring
//! `gproxy-provider-core::provider::{UpstreamHttpRequest,UpstreamHttpResponse}`.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

use crate::InboundRequest;
use gatewayrs_common::Family;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub is_stream: bool,
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum ProtocolError {
    Unsupported(&'static str),
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Unsupported(what) => write!(f, "unsupported: {what}"),
            ProtocolError::Malformed(msg) => write!(f, "malformed request: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The external collaborator contract for protocol conversion. A concrete
/// implementation translates a gateway-agnostic [`InboundRequest`] into the
/// wire shape a given upstream (keyed by `target_family`, since a composite
/// channel may route an Anthropic-shaped request to an OpenAI-shaped
/// upstream) expects, and translates the raw upstream bytes back.
#[async_trait]
pub trait ProtocolConverter: Send + Sync {
    fn build_upstream_request(
        &self,
        base_url: &str,
        target_family: Family,
        req: &InboundRequest,
        model_override: Option<&str>,
    ) -> Result<UpstreamHttpRequest, ProtocolError>;

    /// Rewrites an upstream error body into the shape the original caller's
    /// frontend protocol expects, so an Anthropic-shaped client always sees
    /// an Anthropic-shaped error even when the last attempt hit an
    /// OpenAI-shaped upstream.
    fn render_error(
        &self,
        client_family: Family,
        status: u16,
        upstream_body: &[u8],
    ) -> UpstreamHttpResponse;
}
