//! §7 error classification: every failure is tagged with a propagation
//! policy up front so the pipeline knows whether to retry, fail the
//! request, or just log.

use bytes::Bytes;
use http::StatusCode;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorised,
    Forbidden,
    ForbiddenNoChannelsAfterPermissionFiltering,
    RateLimited,
    BadRequest,
    PayloadTooLarge,
    UpstreamFault,
    QuotaExhausted,
    ConfigurationFault,
    Internal,
}

impl ErrorKind {
    pub fn is_client_fault(self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthenticated
                | ErrorKind::Unauthorised
                | ErrorKind::Forbidden
                | ErrorKind::ForbiddenNoChannelsAfterPermissionFiltering
                | ErrorKind::RateLimited
                | ErrorKind::BadRequest
                | ErrorKind::PayloadTooLarge
        )
    }

    pub fn is_upstream_fault(self) -> bool {
        matches!(self, ErrorKind::UpstreamFault | ErrorKind::QuotaExhausted)
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthorised => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden | ErrorKind::ForbiddenNoChannelsAfterPermissionFiltering => {
                StatusCode::FORBIDDEN
            }
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::UpstreamFault | ErrorKind::QuotaExhausted => StatusCode::BAD_GATEWAY,
            ErrorKind::ConfigurationFault => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Carried on `RateLimited` errors so the inbound HTTP layer can render
/// `X-RateLimit-*` / `Retry-After` (§6) without re-deriving the decision.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub rate_limit: Option<RateLimitInfo>,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status_code(), self.message)
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), rate_limit: None }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn rate_limited_with_info(message: impl Into<String>, rate_limit: RateLimitInfo) -> Self {
        Self { kind: ErrorKind::RateLimited, message: message.into(), rate_limit: Some(rate_limit) }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Synthesises a client-facing body for the "all channels exhausted"
    /// case, mirroring the last upstream error shape when one is known.
    pub fn exhausted_envelope(&self, last_upstream_body: Option<&Bytes>) -> Bytes {
        if let Some(body) = last_upstream_body {
            return body.clone();
        }
        Bytes::from(
            serde_json::json!({
                "error": {
                    "type": "upstream_unavailable",
                    "message": self.message,
                }
            })
            .to_string(),
        )
    }
}
