//! JSON channel/key configuration loading — the `STORAGE_BACKEND=json`
//! layout from spec §6. The database-backed variant is an external
//! collaborator (persistence engine choice is explicitly out of scope);
//! this loader only has to get a runnable gateway wired up from a file.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use gatewayrs_common::Family;
use gatewayrs_core::{hash_api_key, ApiKeyEntry, AuthSnapshot};
use gatewayrs_health::{QuotaConfig, QuotaKind, ResetMode, ResetUnit};
use gatewayrs_scheduler::{ApiKeyPermissions, Channel, ChannelCredentials, ChannelStatus, CompositeMapping};
use serde::Deserialize;
use time::OffsetDateTime;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub channels: Vec<ChannelDef>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyDef>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelDef {
    pub id: String,
    pub family: FamilyDef,
    #[serde(default)]
    pub display_name: String,
    pub service_type: String,
    pub base_url: String,
    #[serde(default)]
    pub credentials: CredentialsDef,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rpm_limit: u32,
    #[serde(default)]
    pub queue_enabled: bool,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default)]
    pub quota: Option<QuotaDef>,
    #[serde(default)]
    pub composite_mappings: Vec<CompositeMappingDef>,
}

fn default_queue_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FamilyDef {
    Messages,
    Responses,
    Gemini,
}

impl From<FamilyDef> for Family {
    fn from(value: FamilyDef) -> Self {
        match value {
            FamilyDef::Messages => Family::Messages,
            FamilyDef::Responses => Family::Responses,
            FamilyDef::Gemini => Family::Gemini,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialsDef {
    #[default]
    None,
    ApiKeys {
        keys: Vec<String>,
    },
    OAuth,
    Composite,
}

impl From<CredentialsDef> for ChannelCredentials {
    fn from(value: CredentialsDef) -> Self {
        match value {
            CredentialsDef::None => ChannelCredentials::None,
            CredentialsDef::ApiKeys { keys } => ChannelCredentials::ApiKeys(keys),
            CredentialsDef::OAuth => ChannelCredentials::OAuth,
            CredentialsDef::Composite => ChannelCredentials::Composite,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QuotaDef {
    pub kind: QuotaKindDef,
    pub limit: i64,
    #[serde(default)]
    pub reset_mode: ResetModeDef,
    #[serde(default = "default_reset_interval")]
    pub reset_interval: u32,
    #[serde(default)]
    pub reset_unit: ResetUnitDef,
}

fn default_reset_interval() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKindDef {
    None,
    Requests,
    Credit,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetModeDef {
    #[default]
    Fixed,
    Rolling,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetUnitDef {
    Hours,
    #[default]
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Deserialize)]
pub struct CompositeMappingDef {
    pub pattern: String,
    pub target_channel_id: String,
    #[serde(default)]
    pub target_model_override: Option<String>,
    #[serde(default)]
    pub failover_chain: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyDef {
    pub key: String,
    pub key_id: String,
    pub client_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub rpm_limit: u32,
    #[serde(default)]
    pub allowed_endpoints: HashSet<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub allowed_channels: HashMap<FamilyDef, HashSet<String>>,
}

fn default_true() -> bool {
    true
}

pub fn load(path: &Path) -> anyhow::Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Groups channel definitions by family for `ChannelScheduler::set_channels`.
pub fn channels_by_family(file: &ConfigFile) -> HashMap<Family, Vec<Channel>> {
    let now = OffsetDateTime::now_utc();
    let mut grouped: HashMap<Family, Vec<Channel>> = HashMap::new();
    for def in &file.channels {
        let family: Family = def.family.into();
        let channel = Channel {
            id: def.id.clone(),
            family,
            display_name: if def.display_name.is_empty() { def.id.clone() } else { def.display_name.clone() },
            service_type: def.service_type.clone(),
            credentials: def.credentials_clone().into(),
            base_url: def.base_url.clone(),
            priority: def.priority,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: def.quota.as_ref().map(|q| quota_config(q, now)),
            rpm_limit: def.rpm_limit,
            queue_enabled: def.queue_enabled,
            queue_timeout: Duration::from_secs(def.queue_timeout_secs),
            composite_mappings: def
                .composite_mappings
                .iter()
                .map(|m| CompositeMapping {
                    pattern: m.pattern.clone(),
                    target_channel_id: m.target_channel_id.clone(),
                    target_model_override: m.target_model_override.clone(),
                    failover_chain: m.failover_chain.clone(),
                })
                .collect(),
        };
        grouped.entry(family).or_default().push(channel);
    }
    grouped
}

impl ChannelDef {
    fn credentials_clone(&self) -> CredentialsDef {
        match &self.credentials {
            CredentialsDef::None => CredentialsDef::None,
            CredentialsDef::ApiKeys { keys } => CredentialsDef::ApiKeys { keys: keys.clone() },
            CredentialsDef::OAuth => CredentialsDef::OAuth,
            CredentialsDef::Composite => CredentialsDef::Composite,
        }
    }
}

fn quota_config(def: &QuotaDef, first_reset: OffsetDateTime) -> QuotaConfig {
    QuotaConfig {
        kind: match def.kind {
            QuotaKindDef::None => QuotaKind::None,
            QuotaKindDef::Requests => QuotaKind::Requests,
            QuotaKindDef::Credit => QuotaKind::Credit,
        },
        limit: def.limit,
        reset_mode: match def.reset_mode {
            ResetModeDef::Fixed => ResetMode::Fixed,
            ResetModeDef::Rolling => ResetMode::Rolling,
        },
        reset_interval: def.reset_interval,
        reset_unit: match def.reset_unit {
            ResetUnitDef::Hours => ResetUnit::Hours,
            ResetUnitDef::Days => ResetUnit::Days,
            ResetUnitDef::Weeks => ResetUnit::Weeks,
            ResetUnitDef::Months => ResetUnit::Months,
        },
        first_reset,
    }
}

pub fn auth_snapshot(file: &ConfigFile) -> AuthSnapshot {
    let mut keys_by_value = HashMap::new();
    for def in &file.api_keys {
        let mut allowed_channels = HashMap::new();
        for (family, ids) in &def.allowed_channels {
            allowed_channels.insert(Family::from(*family), ids.clone());
        }
        let entry = ApiKeyEntry {
            key_id: def.key_id.clone(),
            client_id: def.client_id.clone(),
            enabled: def.enabled,
            is_admin: def.is_admin,
            rpm_limit: def.rpm_limit,
            permissions: ApiKeyPermissions {
                allowed_endpoints: def.allowed_endpoints.clone(),
                allowed_channels,
                allowed_models: def.allowed_models.clone(),
            },
        };
        keys_by_value.insert(hash_api_key(&def.key), entry);
    }
    AuthSnapshot { keys_by_value }
}
