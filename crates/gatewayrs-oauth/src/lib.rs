//! Component C — the OAuth token manager for subscription-style upstreams.
//!
//! Grounded on `gproxy-provider-impl::provider::claudecode::refresh`'s
//! cache-then-refresh-with-fallback-chain shape, generalized away from a
//! single provider's URL quirks into a per-channel [`RefreshConfig`].

pub mod jwt;

pub use jwt::{parse_claims, JwtClaims};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::warn;

const EXPIRY_SAFETY_MARGIN_SECS: i64 = 5 * 60;
const LAST_REFRESH_GRACE_SECS: i64 = 55 * 60;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown oauth channel {0:?}")]
    UnknownChannel(String),
    #[error("jwt is not in header.payload.signature shape")]
    InvalidJwtShape,
    #[error("jwt missing mandatory claim {0:?}")]
    MissingClaim(&'static str),
    #[error("failed to decode refresh response json: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("refresh endpoint returned http {status}: {body}")]
    RefreshHttp { status: u16, body: String },
    #[error("refresh request failed: {0}")]
    Transport(String),
}

/// In-memory OAuth credential state for one channel. Mutated only under the
/// manager's per-bundle write lock; `last_refresh` is updated on every
/// successful refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub account_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refresh: OffsetDateTime,
    /// Unix seconds the access token expires at, when known.
    pub expires_at: Option<i64>,
}

impl TokenBundle {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        if let Some(exp) = self.expires_at {
            if exp - now.unix_timestamp() > EXPIRY_SAFETY_MARGIN_SECS {
                return true;
            }
        }
        (now - self.last_refresh).whole_seconds() < LAST_REFRESH_GRACE_SECS
    }
}

/// Per-channel refresh endpoint parameters; the generalisation of the
/// teacher's per-provider hardcoded URLs and `CLIENT_ID` constant.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub token_url: String,
    pub client_id: String,
    pub max_attempts: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            client_id: String::new(),
            max_attempts: 3,
        }
    }
}

pub struct RefreshOutcome {
    pub access_token: String,
    pub bundle: TokenBundle,
    /// True when the bundle changed and the caller should persist it.
    pub persist_needed: bool,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
}

pub struct OAuthManager {
    bundles: RwLock<HashMap<String, Arc<RwLock<TokenBundle>>>>,
    client: wreq::Client,
}

impl OAuthManager {
    pub fn new() -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            client: wreq::Client::new(),
        }
    }

    pub async fn register(&self, channel_id: &str, bundle: TokenBundle) {
        self.bundles
            .write()
            .await
            .insert(channel_id.to_string(), Arc::new(RwLock::new(bundle)));
    }

    async fn bundle_handle(&self, channel_id: &str) -> Result<Arc<RwLock<TokenBundle>>, OAuthError> {
        self.bundles
            .read()
            .await
            .get(channel_id)
            .cloned()
            .ok_or_else(|| OAuthError::UnknownChannel(channel_id.to_string()))
    }

    /// Returns a currently-valid access token for `channel_id`, refreshing
    /// via `config` if the cached bundle is stale. See spec §4.C for the
    /// exact freshness windows.
    pub async fn get_valid_token(
        &self,
        channel_id: &str,
        config: &RefreshConfig,
    ) -> Result<RefreshOutcome, OAuthError> {
        let handle = self.bundle_handle(channel_id).await?;
        let now = OffsetDateTime::now_utc();
        {
            let bundle = handle.read().await;
            if bundle.is_fresh(now) {
                return Ok(RefreshOutcome {
                    access_token: bundle.access_token.clone(),
                    bundle: bundle.clone(),
                    persist_needed: false,
                });
            }
        }

        let mut bundle = handle.write().await;
        let now = OffsetDateTime::now_utc();
        if bundle.is_fresh(now) {
            return Ok(RefreshOutcome {
                access_token: bundle.access_token.clone(),
                bundle: bundle.clone(),
                persist_needed: false,
            });
        }

        let Some(refresh_token) = bundle.refresh_token.clone() else {
            return Ok(RefreshOutcome {
                access_token: bundle.access_token.clone(),
                bundle: bundle.clone(),
                persist_needed: false,
            });
        };

        let refreshed = self.refresh_with_backoff(&refresh_token, config).await?;
        bundle.access_token = refreshed.access_token.clone();
        if refreshed.refresh_token.is_some() {
            bundle.refresh_token = refreshed.refresh_token;
        }
        if refreshed.id_token.is_some() {
            bundle.id_token = refreshed.id_token;
        }
        bundle.last_refresh = OffsetDateTime::now_utc();
        bundle.expires_at = refreshed
            .expires_in
            .map(|secs| OffsetDateTime::now_utc().unix_timestamp() + secs);

        Ok(RefreshOutcome {
            access_token: bundle.access_token.clone(),
            bundle: bundle.clone(),
            persist_needed: true,
        })
    }

    async fn refresh_with_backoff(
        &self,
        refresh_token: &str,
        config: &RefreshConfig,
    ) -> Result<RefreshResponse, OAuthError> {
        let mut delay = Duration::from_secs(1);
        let mut last_err = None;
        for attempt in 0..config.max_attempts.max(1) {
            match self.refresh_once(refresh_token, config).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(event = "oauth_refresh_retry", attempt, error = %err);
                    last_err = Some(err);
                    if attempt + 1 < config.max_attempts.max(1) {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(OAuthError::Transport("refresh exhausted retries".into())))
    }

    async fn refresh_once(
        &self,
        refresh_token: &str,
        config: &RefreshConfig,
    ) -> Result<RefreshResponse, OAuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .client
            .post(&config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|err| OAuthError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| OAuthError::Transport(err.to_string()))?;
        if status < 200 || status >= 300 {
            return Err(OAuthError::RefreshHttp {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Default for OAuthManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(expires_at: Option<i64>, last_refresh: OffsetDateTime) -> TokenBundle {
        TokenBundle {
            access_token: "tok".into(),
            refresh_token: Some("refresh".into()),
            id_token: None,
            account_id: None,
            last_refresh,
            expires_at,
        }
    }

    #[tokio::test]
    async fn returns_cached_token_when_exp_far_in_future() {
        let manager = OAuthManager::new();
        let now = OffsetDateTime::now_utc();
        manager
            .register("ch1", bundle(Some(now.unix_timestamp() + 3600), now))
            .await;
        let outcome = manager
            .get_valid_token("ch1", &RefreshConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome.access_token, "tok");
        assert!(!outcome.persist_needed);
    }

    #[tokio::test]
    async fn returns_cached_token_within_last_refresh_grace_when_no_exp() {
        let manager = OAuthManager::new();
        let now = OffsetDateTime::now_utc();
        manager.register("ch1", bundle(None, now)).await;
        let outcome = manager
            .get_valid_token("ch1", &RefreshConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome.access_token, "tok");
        assert!(!outcome.persist_needed);
    }

    #[tokio::test]
    async fn unknown_channel_errors() {
        let manager = OAuthManager::new();
        let result = manager.get_valid_token("missing", &RefreshConfig::default()).await;
        assert!(matches!(result, Err(OAuthError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn stale_bundle_without_refresh_token_returns_stale_access_token() {
        let manager = OAuthManager::new();
        let stale = OffsetDateTime::now_utc() - time::Duration::hours(2);
        let mut b = bundle(None, stale);
        b.refresh_token = None;
        manager.register("ch1", b).await;
        let outcome = manager
            .get_valid_token("ch1", &RefreshConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome.access_token, "tok");
        assert!(!outcome.persist_needed);
    }
}
