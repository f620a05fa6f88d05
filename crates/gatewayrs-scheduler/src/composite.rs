//! Composite-channel resolution: pattern-match a model name to a mapping,
//! then walk the primary target plus its failover chain looking for the
//! first channel with usable credentials. Nested composites are resolved
//! recursively with a depth limit (cycle guard, §9).

use std::collections::HashMap;

use crate::model::Channel;

pub const MAX_COMPOSITE_DEPTH: u8 = 4;

#[derive(Debug, Clone)]
pub struct CompositeResolution {
    pub channel_id: String,
    pub resolved_model: Option<String>,
    pub remaining_chain: Vec<String>,
    pub via_failover: bool,
}

/// Resolves `composite` against `model`, returning the first usable
/// concrete channel it routes to. `channels_by_id` must contain every
/// channel in the composite's family, keyed by id.
pub fn resolve(
    composite: &Channel,
    model: &str,
    channels_by_id: &HashMap<&str, &Channel>,
) -> Option<CompositeResolution> {
    let mapping = composite
        .composite_mappings
        .iter()
        .find(|m| model.to_lowercase().contains(&m.pattern.to_lowercase()))?;

    let mut candidates: Vec<(String, bool)> = vec![(mapping.target_channel_id.clone(), false)];
    candidates.extend(mapping.failover_chain.iter().map(|id| (id.clone(), true)));

    resolve_candidates(&candidates, mapping.target_model_override.as_deref(), model, channels_by_id, 0)
}

/// Continues resolution from a previously-carried failover chain, after the
/// pattern match has already happened. Every entry is treated as a chain
/// member (status/suspension/health checks are skipped — "the composite
/// owns the routing decision").
pub fn resolve_next_failover(
    remaining_chain: &[String],
    model_override: Option<&str>,
    model: &str,
    channels_by_id: &HashMap<&str, &Channel>,
) -> Option<CompositeResolution> {
    let candidates: Vec<(String, bool)> = remaining_chain.iter().map(|id| (id.clone(), true)).collect();
    resolve_candidates(&candidates, model_override, model, channels_by_id, 0)
}

fn resolve_candidates(
    candidates: &[(String, bool)],
    model_override: Option<&str>,
    model: &str,
    channels_by_id: &HashMap<&str, &Channel>,
    depth: u8,
) -> Option<CompositeResolution> {
    if depth >= MAX_COMPOSITE_DEPTH {
        return None;
    }
    for (idx, (target_id, is_chain_member)) in candidates.iter().enumerate() {
        let Some(target) = channels_by_id.get(target_id.as_str()) else {
            continue;
        };
        let rest: Vec<String> = candidates[idx + 1..].iter().map(|(id, _)| id.clone()).collect();

        if target.is_composite() {
            let Some(inner) = resolve(target, model, channels_by_id) else {
                continue;
            };
            let mut remaining = inner.remaining_chain;
            remaining.extend(rest);
            return Some(CompositeResolution {
                channel_id: inner.channel_id,
                resolved_model: inner.resolved_model.or_else(|| model_override.map(str::to_string)),
                remaining_chain: remaining,
                via_failover: *is_chain_member || inner.via_failover,
            });
        }

        if target.credentials.is_usable() {
            return Some(CompositeResolution {
                channel_id: target_id.clone(),
                resolved_model: model_override.map(str::to_string),
                remaining_chain: rest,
                via_failover: *is_chain_member,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelCredentials, ChannelStatus, CompositeMapping};
    use gatewayrs_common::Family;

    fn leaf(id: &str, usable: bool) -> Channel {
        Channel {
            id: id.to_string(),
            family: Family::Messages,
            display_name: id.to_string(),
            service_type: "claude".into(),
            credentials: if usable {
                ChannelCredentials::ApiKeys(vec!["k".into()])
            } else {
                ChannelCredentials::None
            },
            base_url: "https://example".into(),
            priority: 1,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: None,
            rpm_limit: 0,
            queue_enabled: false,
            queue_timeout: std::time::Duration::from_secs(30),
            composite_mappings: vec![],
        }
    }

    fn composite(id: &str, mappings: Vec<CompositeMapping>) -> Channel {
        Channel {
            id: id.to_string(),
            family: Family::Messages,
            display_name: id.to_string(),
            service_type: "composite".into(),
            credentials: ChannelCredentials::Composite,
            base_url: String::new(),
            priority: 1,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: None,
            rpm_limit: 0,
            queue_enabled: false,
            queue_timeout: std::time::Duration::from_secs(30),
            composite_mappings: mappings,
        }
    }

    #[test]
    fn resolves_primary_target_when_usable() {
        let sonnet = leaf("c-sonnet", true);
        let opus = leaf("c-opus", true);
        let comp = composite(
            "c",
            vec![CompositeMapping {
                pattern: "sonnet".into(),
                target_channel_id: "c-sonnet".into(),
                target_model_override: None,
                failover_chain: vec!["c-opus".into()],
            }],
        );
        let map: HashMap<&str, &Channel> =
            [("c-sonnet", &sonnet), ("c-opus", &opus), ("c", &comp)].into_iter().collect();
        let resolution = resolve(&comp, "claude-sonnet-4-5", &map).unwrap();
        assert_eq!(resolution.channel_id, "c-sonnet");
        assert!(!resolution.via_failover);
        assert_eq!(resolution.remaining_chain, vec!["c-opus".to_string()]);
    }

    #[test]
    fn falls_to_failover_chain_when_primary_unusable() {
        let sonnet = leaf("c-sonnet", false);
        let opus = leaf("c-opus", true);
        let comp = composite(
            "c",
            vec![CompositeMapping {
                pattern: "sonnet".into(),
                target_channel_id: "c-sonnet".into(),
                target_model_override: None,
                failover_chain: vec!["c-opus".into()],
            }],
        );
        let map: HashMap<&str, &Channel> =
            [("c-sonnet", &sonnet), ("c-opus", &opus), ("c", &comp)].into_iter().collect();
        let resolution = resolve(&comp, "claude-sonnet-4-5", &map).unwrap();
        assert_eq!(resolution.channel_id, "c-opus");
        assert!(resolution.via_failover);
    }

    #[test]
    fn no_pattern_match_returns_none() {
        let comp = composite(
            "c",
            vec![CompositeMapping {
                pattern: "haiku".into(),
                target_channel_id: "c-haiku".into(),
                target_model_override: None,
                failover_chain: vec![],
            }],
        );
        let map: HashMap<&str, &Channel> = [("c", &comp)].into_iter().collect();
        assert!(resolve(&comp, "claude-sonnet-4-5", &map).is_none());
    }
}
