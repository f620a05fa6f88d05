//! The upstream HTTP transport is an external collaborator (§6): this
//! crate only names the contract the attempt loop dispatches through,
//! mirroring the shape of `gproxy-core::upstream_client::UpstreamClient`
//! without committing to a concrete client.

use std::collections::HashMap;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use gatewayrs_protocol::UpstreamHttpRequest;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, DispatchError>> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("response body truncated")]
    Truncated,
}

/// A streamed upstream response: headers arrive up front, the body is
/// consumed incrementally so it can be teed to the client and the usage
/// extractor without buffering the whole thing.
pub struct UpstreamStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: UpstreamHttpRequest) -> Result<UpstreamStreamResponse, DispatchError>;
}
