//! Component G — the request pipeline that ties authentication, permission
//! enforcement, scheduling, rate limiting, OAuth, and usage extraction into
//! the end-to-end request flow. Wire-format conversion and the actual
//! upstream HTTP transport are external collaborators this crate only
//! names a contract for (`dispatch::UpstreamClient`).

pub mod auth;
pub mod classify;
pub mod dispatch;
pub mod error;
pub mod pipeline;

pub use auth::{hash_api_key, hash_client_identity, ApiKeyEntry, AuthContext, AuthSnapshot, MemoryAuth};
pub use classify::{classify_request, Classified};
pub use dispatch::{BodyStream, DispatchError, UpstreamClient, UpstreamStreamResponse};
pub use error::{ErrorKind, GatewayError, RateLimitInfo};
pub use pipeline::{DispatchHandle, PipelineDeps, PipelineOutcome, RequestPipeline};
