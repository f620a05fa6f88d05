//! Final, merged process configuration, following the teacher's
//! env > CLI > DB merge pattern (`gproxy-common::GlobalConfig`).

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("PROXY_ACCESS_KEY must be at least 16 characters")]
    BootstrapKeyTooShort,
    #[error(
        "PROXY_ACCESS_KEY is the insecure default; set ALLOW_INSECURE_DEFAULT_KEY=true for development"
    )]
    InsecureDefaultKey,
}

/// Merged configuration used by the running process. Published behind an
/// `ArcSwap` by the owner; readers clone out of the loaded guard, never hold
/// it across `.await`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Storage backend: `json` or `database`.
    pub storage_backend: StorageBackend,
    pub database_type: DatabaseType,
    pub database_url: String,
    /// Bootstrap admin key, stored only as received; callers hash it before
    /// persisting. Never logged.
    pub bootstrap_key: String,
    pub trusted_proxies: Vec<String>,
    pub config_poll_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Json,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

pub const DEFAULT_BOOTSTRAP_KEY: &str = "changeme-insecure-default-key";
pub const MIN_BOOTSTRAP_KEY_LEN: usize = 16;
pub const MIN_CONFIG_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_CONFIG_POLL_INTERVAL_SECS: u64 = 5;

/// Optional overlay used while merging CLI/env/DB layers, mirroring
/// `GlobalConfigPatch`.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub storage_backend: Option<StorageBackend>,
    pub database_type: Option<DatabaseType>,
    pub database_url: Option<String>,
    pub bootstrap_key: Option<String>,
    pub trusted_proxies: Option<Vec<String>>,
    pub config_poll_interval_secs: Option<u64>,
    pub allow_insecure_default_key: bool,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.storage_backend.is_some() {
            self.storage_backend = other.storage_backend;
        }
        if other.database_type.is_some() {
            self.database_type = other.database_type;
        }
        if other.database_url.is_some() {
            self.database_url = other.database_url;
        }
        if other.bootstrap_key.is_some() {
            self.bootstrap_key = other.bootstrap_key;
        }
        if other.trusted_proxies.is_some() {
            self.trusted_proxies = other.trusted_proxies;
        }
        if other.config_poll_interval_secs.is_some() {
            self.config_poll_interval_secs = other.config_poll_interval_secs;
        }
        self.allow_insecure_default_key =
            self.allow_insecure_default_key || other.allow_insecure_default_key;
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let bootstrap_key = self
            .bootstrap_key
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP_KEY.to_string());

        if bootstrap_key.len() < MIN_BOOTSTRAP_KEY_LEN {
            return Err(GatewayConfigError::BootstrapKeyTooShort);
        }
        if bootstrap_key == DEFAULT_BOOTSTRAP_KEY && !self.allow_insecure_default_key {
            return Err(GatewayConfigError::InsecureDefaultKey);
        }

        let poll = self
            .config_poll_interval_secs
            .unwrap_or(DEFAULT_CONFIG_POLL_INTERVAL_SECS)
            .max(MIN_CONFIG_POLL_INTERVAL_SECS);

        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            storage_backend: self.storage_backend.unwrap_or(StorageBackend::Json),
            database_type: self.database_type.unwrap_or(DatabaseType::Sqlite),
            database_url: self
                .database_url
                .ok_or(GatewayConfigError::MissingField("database_url"))?,
            bootstrap_key,
            trusted_proxies: self.trusted_proxies.unwrap_or_default(),
            config_poll_interval_secs: poll,
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            storage_backend: Some(value.storage_backend),
            database_type: Some(value.database_type),
            database_url: Some(value.database_url),
            bootstrap_key: Some(value.bootstrap_key),
            trusted_proxies: Some(value.trusted_proxies),
            config_poll_interval_secs: Some(value.config_poll_interval_secs),
            allow_insecure_default_key: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_bootstrap_key() {
        let patch = GatewayConfigPatch {
            bootstrap_key: Some("short".to_string()),
            database_url: Some("sqlite://test.db".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GatewayConfigError::BootstrapKeyTooShort)
        ));
    }

    #[test]
    fn rejects_default_key_without_opt_in() {
        let patch = GatewayConfigPatch {
            database_url: Some("sqlite://test.db".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GatewayConfigError::InsecureDefaultKey)
        ));
    }

    #[test]
    fn allows_default_key_with_opt_in() {
        let patch = GatewayConfigPatch {
            database_url: Some("sqlite://test.db".to_string()),
            allow_insecure_default_key: true,
            ..Default::default()
        };
        assert!(patch.into_config().is_ok());
    }

    #[test]
    fn clamps_poll_interval_to_minimum() {
        let patch = GatewayConfigPatch {
            database_url: Some("sqlite://test.db".to_string()),
            allow_insecure_default_key: true,
            config_poll_interval_secs: Some(0),
            ..Default::default()
        };
        let cfg = patch.into_config().unwrap();
        assert_eq!(cfg.config_poll_interval_secs, MIN_CONFIG_POLL_INTERVAL_SECS);
    }
}
