//! Client authentication (§4.G step 2): constant-time key lookup against an
//! in-memory snapshot, with a bootstrap master key carved out from the
//! environment.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use gatewayrs_scheduler::ApiKeyPermissions;
use http::HeaderMap;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct ApiKeyEntry {
    pub key_id: String,
    pub client_id: String,
    pub enabled: bool,
    pub is_admin: bool,
    pub rpm_limit: u32,
    pub permissions: ApiKeyPermissions,
}

/// Keyed by `hash_api_key(raw_key)`, never the raw key value (§3: "stored as
/// salted hash, never plaintext").
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub keys_by_value: HashMap<String, ApiKeyEntry>,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key_id: String,
    pub client_id: String,
    pub is_admin: bool,
    pub rpm_limit: u32,
    pub permissions: ApiKeyPermissions,
}

/// RCU snapshot of the key table, refreshed whenever storage signals a
/// change. Lookups never block on I/O.
pub struct MemoryAuth {
    snapshot: ArcSwap<AuthSnapshot>,
    bootstrap_key: Option<String>,
}

impl MemoryAuth {
    pub fn new(snapshot: AuthSnapshot, bootstrap_key: Option<String>) -> Self {
        Self { snapshot: ArcSwap::from_pointee(snapshot), bootstrap_key }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Authenticates a presented key extracted from request headers,
    /// falling back to the bootstrap master key via constant-time compare.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, GatewayError> {
        let presented = extract_api_key(headers)
            .ok_or_else(|| GatewayError::unauthenticated("missing api key"))?;

        if let Some(bootstrap) = &self.bootstrap_key {
            if constant_time_eq(bootstrap.as_bytes(), presented.as_bytes()) {
                return Ok(AuthContext {
                    key_id: "bootstrap".to_string(),
                    client_id: "bootstrap".to_string(),
                    is_admin: true,
                    rpm_limit: 0,
                    permissions: ApiKeyPermissions::default(),
                });
            }
        }

        let snapshot = self.snapshot.load();
        let entry = snapshot
            .keys_by_value
            .get(hash_api_key(&presented).as_str())
            .ok_or_else(|| GatewayError::unauthenticated("invalid api key"))?;

        if !entry.enabled {
            return Err(GatewayError::unauthenticated("api key disabled"));
        }

        Ok(AuthContext {
            key_id: entry.key_id.clone(),
            client_id: entry.client_id.clone(),
            is_admin: entry.is_admin,
            rpm_limit: entry.rpm_limit,
            permissions: entry.permissions.clone(),
        })
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(|value| value.to_string())
}

/// Byte-length-revealing but timing-safe comparison: the loop always walks
/// the full length of the shorter input, accumulating mismatches by XOR.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Client identity for trace affinity (§4.E) is hashed before use so the
/// affinity map never holds a raw API key or IP in memory.
pub fn hash_client_identity(raw: &str) -> String {
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}

/// Domain-separated salted hash of a client API key (§3: "stored as salted
/// hash, never plaintext"). `keys_by_value` is keyed by this, never by the
/// raw key, so a leaked config snapshot or core dump doesn't recover the
/// presentable key.
const API_KEY_HASH_CONTEXT: &str = "gatewayrs api_key v1 2026-07-28";

pub fn hash_api_key(raw: &str) -> String {
    let derived = blake3::derive_key(API_KEY_HASH_CONTEXT, raw.as_bytes());
    blake3::Hash::from(derived).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn x_api_key_takes_precedence_over_bearer() {
        let mut headers = headers_with("x-api-key", "from-x-api-key");
        headers.insert("authorization", http::HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-x-api-key"));
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let headers = headers_with("authorization", "Bearer secret-token");
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret-token"));
    }

    #[test]
    fn missing_key_is_unauthenticated() {
        let auth = MemoryAuth::new(AuthSnapshot::default(), None);
        let err = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unauthenticated);
    }

    #[test]
    fn bootstrap_key_grants_admin() {
        let auth = MemoryAuth::new(AuthSnapshot::default(), Some("master-key-1234567890".into()));
        let headers = headers_with("x-api-key", "master-key-1234567890");
        let ctx = auth.authenticate(&headers).unwrap();
        assert!(ctx.is_admin);
    }

    #[test]
    fn disabled_key_is_rejected() {
        let mut keys = HashMap::new();
        keys.insert(
            hash_api_key("k1"),
            ApiKeyEntry {
                key_id: "k1".into(),
                client_id: "c1".into(),
                enabled: false,
                is_admin: false,
                rpm_limit: 0,
                permissions: ApiKeyPermissions::default(),
            },
        );
        let auth = MemoryAuth::new(AuthSnapshot { keys_by_value: keys }, None);
        let headers = headers_with("x-api-key", "k1");
        assert!(auth.authenticate(&headers).is_err());
    }

    #[test]
    fn enabled_key_is_looked_up_by_hash_not_raw_value() {
        let mut keys = HashMap::new();
        keys.insert(
            hash_api_key("k1"),
            ApiKeyEntry {
                key_id: "k1".into(),
                client_id: "c1".into(),
                enabled: true,
                is_admin: false,
                rpm_limit: 0,
                permissions: ApiKeyPermissions::default(),
            },
        );
        assert!(!keys.contains_key("k1"));
        let auth = MemoryAuth::new(AuthSnapshot { keys_by_value: keys }, None);
        let headers = headers_with("x-api-key", "k1");
        let ctx = auth.authenticate(&headers).unwrap();
        assert_eq!(ctx.key_id, "k1");
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"short", b"longerstring"));
        assert!(constant_time_eq(b"match", b"match"));
    }
}
