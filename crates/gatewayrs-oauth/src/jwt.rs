//! Signature-less JWT claim extraction. The tokens are only ever forwarded
//! to the upstream that issued them — no cryptographic validation is
//! performed here, matching the teacher's own trust model for subscription
//! OAuth credentials (see `gproxy-provider-impl`'s Claude Code / Codex OAuth
//! modules, which likewise treat these as opaque bearer tokens).

use base64::Engine;
use serde::Deserialize;

use crate::OAuthError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JwtClaims {
    pub exp: Option<i64>,
    pub email: Option<String>,
    #[serde(default)]
    pub chatgpt_account_id: Option<String>,
}

/// Splits a JWT on `.`, base64url-decodes the payload segment, and parses it
/// as JSON. Returns [`OAuthError::InvalidJwtShape`] if the token doesn't have
/// exactly three dot-separated segments.
pub fn parse_claims(token: &str) -> Result<JwtClaims, OAuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(OAuthError::InvalidJwtShape);
    }
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| OAuthError::InvalidJwtShape)?;
    let claims: JwtClaims = serde_json::from_slice(&payload)?;
    Ok(claims)
}
