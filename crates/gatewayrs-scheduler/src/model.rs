//! §3 data model: channels, their credentials, and the permission bundle
//! attached to a client API key.

use std::collections::{HashMap, HashSet};

use gatewayrs_common::Family;
use gatewayrs_health::QuotaConfig;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Active,
    Suspended,
    Disabled,
}

pub const SERVICE_TYPE_COMPOSITE: &str = "composite";

/// A channel's credential shape. Modeled as a tagged enum rather than the
/// teacher's `Credential` enum directly — this gateway doesn't need per-
/// provider payload shapes (that's the protocol converter's concern), only
/// enough to know whether a channel is dispatchable.
#[derive(Debug, Clone)]
pub enum ChannelCredentials {
    ApiKeys(Vec<String>),
    OAuth,
    Composite,
    None,
}

impl ChannelCredentials {
    pub fn is_usable(&self) -> bool {
        match self {
            ChannelCredentials::ApiKeys(keys) => !keys.is_empty(),
            ChannelCredentials::OAuth => true,
            ChannelCredentials::Composite => true,
            ChannelCredentials::None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeMapping {
    pub pattern: String,
    pub target_channel_id: String,
    pub target_model_override: Option<String>,
    pub failover_chain: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub family: Family,
    pub display_name: String,
    pub service_type: String,
    pub credentials: ChannelCredentials,
    pub base_url: String,
    /// Lower value = higher priority.
    pub priority: i32,
    pub status: ChannelStatus,
    pub promotion_until: Option<OffsetDateTime>,
    pub quota: Option<QuotaConfig>,
    pub rpm_limit: u32,
    pub queue_enabled: bool,
    pub queue_timeout: std::time::Duration,
    pub composite_mappings: Vec<CompositeMapping>,
}

impl Channel {
    pub fn is_composite(&self) -> bool {
        self.service_type.eq_ignore_ascii_case(SERVICE_TYPE_COMPOSITE)
    }

    pub fn is_promoted(&self, now: OffsetDateTime) -> bool {
        matches!(self.promotion_until, Some(until) if until > now)
    }

    /// A channel with neither API keys nor a valid OAuth bundle and that
    /// isn't composite is unusable and must be skipped during selection.
    pub fn has_usable_credentials(&self) -> bool {
        self.is_composite() || self.credentials.is_usable()
    }
}

/// A permission bundle attached to a client API key. Empty sets mean
/// "unrestricted" per spec §3.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyPermissions {
    pub allowed_endpoints: HashSet<String>,
    pub allowed_channels: HashMap<Family, HashSet<String>>,
    pub allowed_models: Vec<String>,
}

impl ApiKeyPermissions {
    pub fn endpoint_allowed(&self, endpoint: &str) -> bool {
        self.allowed_endpoints.is_empty() || self.allowed_endpoints.contains(endpoint)
    }

    pub fn channels_for(&self, family: Family) -> Option<&HashSet<String>> {
        self.allowed_channels.get(&family).filter(|set| !set.is_empty())
    }

    /// Matches `model` against the allowed-models glob list: exact match,
    /// `*`-glob, or `prefix*`. Empty list means unrestricted. Does not
    /// apply the `base(suffix)` thinking-suffix fallback — that's a
    /// pipeline-level concern (spec §4.G) layered on top of this.
    pub fn model_allowed(&self, model: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }
        self.allowed_models.iter().any(|pattern| matches_model_pattern(pattern, model))
    }
}

pub fn matches_model_pattern(pattern: &str, model: &str) -> bool {
    if pattern == model {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return model.starts_with(prefix);
    }
    glob_match(pattern, model)
}

/// Minimal `*`/`?` glob matcher; sufficient for model-name allow-lists.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    glob_match_inner(&pat, &txt)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_inner(&pattern[1..], &text[1..]),
        Some(c) => !text.is_empty() && *c == text[0] && glob_match_inner(&pattern[1..], &text[1..]),
    }
}

/// If `model` has the `base(suffix)` shape with a recognised thinking-level
/// suffix, returns `base`. Used by the pipeline to retry a permission/model
/// check against the base model when the full name doesn't match directly.
pub fn strip_thinking_suffix(model: &str) -> Option<&str> {
    const SUFFIXES: &[&str] = &["low", "medium", "high", "xhigh"];
    let open = model.find('(')?;
    if !model.ends_with(')') {
        return None;
    }
    let suffix = &model[open + 1..model.len() - 1];
    if SUFFIXES.contains(&suffix) {
        Some(&model[..open])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_allowed_empty_is_unrestricted() {
        let perms = ApiKeyPermissions::default();
        assert!(perms.model_allowed("anything"));
    }

    #[test]
    fn model_allowed_exact_and_prefix_glob() {
        let mut perms = ApiKeyPermissions::default();
        perms.allowed_models = vec!["claude-haiku-4-5".to_string(), "claude-opus*".to_string()];
        assert!(perms.model_allowed("claude-haiku-4-5"));
        assert!(perms.model_allowed("claude-opus-4-1"));
        assert!(!perms.model_allowed("claude-sonnet-4-5"));
    }

    #[test]
    fn strip_thinking_suffix_recognises_known_levels() {
        assert_eq!(strip_thinking_suffix("claude-opus-4-1(high)"), Some("claude-opus-4-1"));
        assert_eq!(strip_thinking_suffix("claude-opus-4-1(ultra)"), None);
        assert_eq!(strip_thinking_suffix("claude-opus-4-1"), None);
    }

    #[test]
    fn channel_without_credentials_and_not_composite_is_unusable() {
        let channel = Channel {
            id: "a".into(),
            family: Family::Messages,
            display_name: "A".into(),
            service_type: "claude".into(),
            credentials: ChannelCredentials::ApiKeys(vec![]),
            base_url: "https://example".into(),
            priority: 1,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: None,
            rpm_limit: 0,
            queue_enabled: false,
            queue_timeout: std::time::Duration::from_secs(30),
            composite_mappings: vec![],
        };
        assert!(!channel.has_usable_credentials());
    }
}
