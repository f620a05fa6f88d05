//! Component F — the channel scheduler. The reliability heart: promotion
//! override → trace affinity → strategy traversal → degraded fallback →
//! give up, with composite resolution folded into each rule.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use gatewayrs_common::Family;
use gatewayrs_health::{MetricsWindows, QuotaTracker};

use crate::composite::{self, CompositeResolution};
use crate::model::Channel;
use crate::trace_affinity::TraceAffinityMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Failover,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Promotion,
    PromotionViaComposite,
    PromotionViaCompositeFailover,
    TraceAffinity,
    TraceAffinityViaComposite,
    TraceAffinityViaCompositeFailover,
    Strategy,
    StrategyViaComposite,
    StrategyViaCompositeFailover,
    Degraded,
    DegradedViaComposite,
    DegradedViaCompositeFailover,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        use SelectionReason::*;
        match self {
            Promotion => "promotion",
            PromotionViaComposite => "promotion_via_composite",
            PromotionViaCompositeFailover => "promotion_via_composite_failover",
            TraceAffinity => "trace_affinity",
            TraceAffinityViaComposite => "trace_affinity_via_composite",
            TraceAffinityViaCompositeFailover => "trace_affinity_via_composite_failover",
            Strategy => "strategy",
            StrategyViaComposite => "strategy_via_composite",
            StrategyViaCompositeFailover => "strategy_via_composite_failover",
            Degraded => "degraded",
            DegradedViaComposite => "degraded_via_composite",
            DegradedViaCompositeFailover => "degraded_via_composite_failover",
        }
    }

    fn for_rule(base: RuleKind, via_composite: bool, via_failover: bool) -> Self {
        use RuleKind::*;
        match (base, via_composite, via_failover) {
            (RulePromotion, false, _) => SelectionReason::Promotion,
            (RulePromotion, true, false) => SelectionReason::PromotionViaComposite,
            (RulePromotion, true, true) => SelectionReason::PromotionViaCompositeFailover,
            (RuleTraceAffinity, false, _) => SelectionReason::TraceAffinity,
            (RuleTraceAffinity, true, false) => SelectionReason::TraceAffinityViaComposite,
            (RuleTraceAffinity, true, true) => SelectionReason::TraceAffinityViaCompositeFailover,
            (RuleStrategy, false, _) => SelectionReason::Strategy,
            (RuleStrategy, true, false) => SelectionReason::StrategyViaComposite,
            (RuleStrategy, true, true) => SelectionReason::StrategyViaCompositeFailover,
            (RuleDegraded, false, _) => SelectionReason::Degraded,
            (RuleDegraded, true, false) => SelectionReason::DegradedViaComposite,
            (RuleDegraded, true, true) => SelectionReason::DegradedViaCompositeFailover,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RuleKind {
    RulePromotion,
    RuleTraceAffinity,
    RuleStrategy,
    RuleDegraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    NoChannelsAvailable,
    NoChannelsAfterPermissionFiltering,
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// Stable channel id — the sole identity used for selection, logging,
    /// and permission checks (see the channel-identity-drift design note:
    /// the legacy integer index is never used here).
    pub channel_id: String,
    pub reason: SelectionReason,
    pub composite_id: Option<String>,
    pub resolved_model: Option<String>,
    pub remaining_chain: Vec<String>,
}

pub struct ChannelScheduler {
    channels: RwLock<HashMap<Family, Vec<Channel>>>,
    metrics: Arc<MetricsWindows>,
    quotas: Arc<QuotaTracker>,
    trace_affinity: Arc<TraceAffinityMap>,
    strategies: RwLock<HashMap<Family, Strategy>>,
    round_robin_cursor: RwLock<HashMap<Family, u64>>,
    /// Admin override: when set, the circuit breaker is bypassed entirely
    /// for every family (spec §4.F: "the admin has taken explicit
    /// responsibility").
    failover_override: AtomicBool,
}

impl ChannelScheduler {
    pub fn new(metrics: Arc<MetricsWindows>, quotas: Arc<QuotaTracker>, trace_affinity: Arc<TraceAffinityMap>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            metrics,
            quotas,
            trace_affinity,
            strategies: RwLock::new(HashMap::new()),
            round_robin_cursor: RwLock::new(HashMap::new()),
            failover_override: AtomicBool::new(false),
        }
    }

    pub async fn set_channels(&self, family: Family, channels: Vec<Channel>) {
        self.channels.write().await.insert(family, channels);
    }

    pub async fn set_strategy(&self, family: Family, strategy: Strategy) {
        self.strategies.write().await.insert(family, strategy);
    }

    /// Looks up a channel's static configuration (base url, credentials,
    /// service type) by id — the pipeline needs this after `select` returns
    /// only the stable id, to actually build and dispatch the upstream call.
    pub async fn get_channel(&self, family: Family, channel_id: &str) -> Option<Channel> {
        self.channels.read().await.get(&family)?.iter().find(|c| c.id == channel_id).cloned()
    }

    /// Lists every configured channel for `family` in priority order —
    /// the read-only admin status surface uses this, never the selection
    /// path (which only ever returns a stable id).
    pub async fn list_channels(&self, family: Family) -> Vec<Channel> {
        let mut channels = self.channels.read().await.get(&family).cloned().unwrap_or_default();
        channels.sort_by_key(|c| c.priority);
        channels
    }

    pub fn set_failover_override(&self, bypass: bool) {
        self.failover_override.store(bypass, Ordering::Relaxed);
    }

    /// Feedback interface: forwards into the metrics component per spec
    /// §4.F. The scheduler itself never mutates metrics/quota/affinity
    /// state outside of these explicit calls.
    pub async fn record_success(&self, family: Family, channel_id: &str) {
        self.metrics.record_success(family, channel_id).await;
    }

    pub async fn record_failure(&self, family: Family, channel_id: &str) {
        self.metrics.record_failure(family, channel_id).await;
    }

    pub async fn set_trace_affinity(&self, client_id: &str, channel_id: &str) {
        self.trace_affinity.set_preferred(client_id, channel_id).await;
    }

    pub async fn update_trace_affinity(&self, client_id: &str) {
        self.trace_affinity.update_last_used(client_id).await;
    }

    /// Selects a channel for `family` given the request's accumulated
    /// failed-channel set, the caller's allowed-channel restriction (`None`
    /// = unrestricted), and the requested model. See spec §4.F for the
    /// rule ordering.
    pub async fn select(
        &self,
        family: Family,
        client_id: &str,
        failed_this_request: &HashSet<String>,
        allowed_channels: Option<&HashSet<String>>,
        model: &str,
    ) -> Result<Selection, SchedulerError> {
        let all_channels = {
            let read = self.channels.read().await;
            read.get(&family).cloned().unwrap_or_default()
        };
        if all_channels.is_empty() {
            return Err(SchedulerError::NoChannelsAvailable);
        }

        let filtered: Vec<Channel> = match allowed_channels {
            Some(allowed) if !allowed.is_empty() => {
                all_channels.iter().filter(|c| allowed.contains(&c.id)).cloned().collect()
            }
            _ => all_channels.clone(),
        };
        if filtered.is_empty() {
            return Err(SchedulerError::NoChannelsAfterPermissionFiltering);
        }

        let channels_by_id: HashMap<&str, &Channel> =
            all_channels.iter().map(|c| (c.id.as_str(), c)).collect();
        let bypass_breaker = self.failover_override.load(Ordering::Relaxed);
        let now = OffsetDateTime::now_utc();

        // Rule 1: promotion override.
        let mut promoted: Vec<&Channel> = filtered
            .iter()
            .filter(|c| c.is_promoted(now))
            .collect();
        promoted.sort_by_key(|c| c.priority);
        for candidate in promoted {
            if let Some(selection) = self
                .try_select(candidate, &channels_by_id, failed_this_request, model, bypass_breaker, RuleKind::RulePromotion)
                .await
            {
                return Ok(selection);
            }
        }

        // Rule 2: trace affinity.
        if let Some(preferred_id) = self.trace_affinity.get_preferred(client_id).await {
            if let Some(candidate) = filtered.iter().find(|c| c.id == preferred_id) {
                if let Some(selection) = self
                    .try_select(candidate, &channels_by_id, failed_this_request, model, bypass_breaker, RuleKind::RuleTraceAffinity)
                    .await
                {
                    return Ok(selection);
                }
            }
        }

        // Rule 3: strategy traversal over healthy-and-available candidates.
        let mut available = Vec::new();
        for candidate in &filtered {
            if self.is_available(candidate, failed_this_request, bypass_breaker).await {
                available.push(candidate);
            }
        }
        let strategy = self.strategies.read().await.get(&family).copied().unwrap_or(Strategy::Failover);
        self.order_by_strategy(&mut available, family, strategy).await;
        for candidate in available {
            if let Some(selection) = self
                .try_select(candidate, &channels_by_id, failed_this_request, model, bypass_breaker, RuleKind::RuleStrategy)
                .await
            {
                return Ok(selection);
            }
        }

        // Rule 4: degraded fallback — lowest failure rate among not-failed,
        // active, not-suspended, credential-bearing channels (health
        // ignored).
        let mut degraded_candidates = Vec::new();
        for candidate in &filtered {
            if failed_this_request.contains(&candidate.id) {
                continue;
            }
            if candidate.status != crate::model::ChannelStatus::Active {
                continue;
            }
            let (suspended, _, _) = self.quotas.is_suspended(family, &candidate.id).await;
            if suspended {
                continue;
            }
            if !candidate.has_usable_credentials() {
                continue;
            }
            let failure_rate = self.metrics.failure_rate(family, &candidate.id).await;
            degraded_candidates.push((candidate, failure_rate));
        }
        degraded_candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        for (candidate, _) in degraded_candidates {
            if let Some(selection) = self
                .try_select(candidate, &channels_by_id, failed_this_request, model, bypass_breaker, RuleKind::RuleDegraded)
                .await
            {
                return Ok(selection);
            }
        }

        Err(SchedulerError::NoChannelsAvailable)
    }

    /// Continues a sticky composite failover after a dispatch failure,
    /// without re-entering the full scheduler (spec §4.G step 5).
    pub async fn next_composite_failover(
        &self,
        family: Family,
        previous: &Selection,
        model: &str,
    ) -> Option<Selection> {
        if previous.remaining_chain.is_empty() {
            return None;
        }
        let all_channels = self.channels.read().await.get(&family).cloned().unwrap_or_default();
        let channels_by_id: HashMap<&str, &Channel> =
            all_channels.iter().map(|c| (c.id.as_str(), c)).collect();
        let resolution = composite::resolve_next_failover(
            &previous.remaining_chain,
            previous.resolved_model.as_deref(),
            model,
            &channels_by_id,
        )?;
        Some(Selection {
            channel_id: resolution.channel_id,
            reason: SelectionReason::StrategyViaCompositeFailover,
            composite_id: previous.composite_id.clone(),
            resolved_model: resolution.resolved_model,
            remaining_chain: resolution.remaining_chain,
        })
    }

    async fn is_available(&self, channel: &Channel, failed_this_request: &HashSet<String>, bypass_breaker: bool) -> bool {
        if failed_this_request.contains(&channel.id) {
            return false;
        }
        if channel.status != crate::model::ChannelStatus::Active {
            return false;
        }
        let (suspended, _, _) = self.quotas.is_suspended(channel.family, &channel.id).await;
        if suspended {
            return false;
        }
        if !channel.has_usable_credentials() {
            return false;
        }
        bypass_breaker || self.metrics.is_healthy(channel.family, &channel.id).await
    }

    async fn order_by_strategy(&self, candidates: &mut Vec<&Channel>, family: Family, strategy: Strategy) {
        match strategy {
            Strategy::Failover => candidates.sort_by_key(|c| c.priority),
            Strategy::RoundRobin => {
                candidates.sort_by_key(|c| c.priority);
                if !candidates.is_empty() {
                    let mut cursor = self.round_robin_cursor.write().await;
                    let counter = cursor.entry(family).or_insert(0);
                    let rotate = (*counter as usize) % candidates.len();
                    candidates.rotate_left(rotate);
                    *counter = counter.wrapping_add(1);
                }
            }
            Strategy::Random => {
                candidates.shuffle(&mut rand::rng());
            }
        }
    }

    async fn try_select(
        &self,
        candidate: &Channel,
        channels_by_id: &HashMap<&str, &Channel>,
        failed_this_request: &HashSet<String>,
        model: &str,
        bypass_breaker: bool,
        rule: RuleKind,
    ) -> Option<Selection> {
        if failed_this_request.contains(&candidate.id) {
            return None;
        }
        if candidate.status != crate::model::ChannelStatus::Active {
            return None;
        }
        let (suspended, _, _) = self.quotas.is_suspended(candidate.family, &candidate.id).await;
        if suspended {
            return None;
        }
        if !(bypass_breaker || self.metrics.is_healthy(candidate.family, &candidate.id).await) {
            // Promotion/affinity rules still require health unless bypassed.
            if matches!(rule, RuleKind::RulePromotion | RuleKind::RuleTraceAffinity) {
                return None;
            }
        }

        if candidate.is_composite() {
            let resolution: CompositeResolution = composite::resolve(candidate, model, channels_by_id)?;
            let reason = SelectionReason::for_rule(rule, true, resolution.via_failover);
            return Some(Selection {
                channel_id: resolution.channel_id,
                reason,
                composite_id: Some(candidate.id.clone()),
                resolved_model: resolution.resolved_model,
                remaining_chain: resolution.remaining_chain,
            });
        }

        if !candidate.credentials.is_usable() {
            return None;
        }
        Some(Selection {
            channel_id: candidate.id.clone(),
            reason: SelectionReason::for_rule(rule, false, false),
            composite_id: None,
            resolved_model: None,
            remaining_chain: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelCredentials, ChannelStatus};

    fn channel(id: &str, priority: i32, status: ChannelStatus) -> Channel {
        Channel {
            id: id.to_string(),
            family: Family::Messages,
            display_name: id.to_string(),
            service_type: "claude".into(),
            credentials: ChannelCredentials::ApiKeys(vec!["k".into()]),
            base_url: "https://example".into(),
            priority,
            status,
            promotion_until: None,
            quota: None,
            rpm_limit: 0,
            queue_enabled: false,
            queue_timeout: std::time::Duration::from_secs(30),
            composite_mappings: vec![],
        }
    }

    fn make_scheduler() -> ChannelScheduler {
        ChannelScheduler::new(
            Arc::new(MetricsWindows::new()),
            Arc::new(QuotaTracker::new()),
            Arc::new(TraceAffinityMap::new()),
        )
    }

    #[tokio::test]
    async fn failover_picks_lowest_priority_first() {
        let scheduler = make_scheduler();
        scheduler
            .set_channels(
                Family::Messages,
                vec![channel("b", 2, ChannelStatus::Active), channel("a", 1, ChannelStatus::Active)],
            )
            .await;
        let selection = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), None, "claude-haiku-4-5")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "a");
        assert_eq!(selection.reason, SelectionReason::Strategy);
    }

    #[tokio::test]
    async fn failed_this_request_is_skipped() {
        let scheduler = make_scheduler();
        scheduler
            .set_channels(
                Family::Messages,
                vec![channel("a", 1, ChannelStatus::Active), channel("b", 2, ChannelStatus::Active)],
            )
            .await;
        let mut failed = HashSet::new();
        failed.insert("a".to_string());
        let selection = scheduler
            .select(Family::Messages, "client-1", &failed, None, "claude-haiku-4-5")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "b");
    }

    #[tokio::test]
    async fn empty_channel_set_after_permission_filter_is_distinct_error() {
        let scheduler = make_scheduler();
        scheduler.set_channels(Family::Messages, vec![channel("a", 1, ChannelStatus::Active)]).await;
        let mut allowed = HashSet::new();
        allowed.insert("other".to_string());
        let result = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), Some(&allowed), "m")
            .await;
        assert_eq!(result.unwrap_err(), SchedulerError::NoChannelsAfterPermissionFiltering);
    }

    #[tokio::test]
    async fn no_channels_configured_is_no_channels_available() {
        let scheduler = make_scheduler();
        let result = scheduler.select(Family::Messages, "c", &HashSet::new(), None, "m").await;
        assert_eq!(result.unwrap_err(), SchedulerError::NoChannelsAvailable);
    }

    #[tokio::test]
    async fn channel_without_credentials_is_never_selected() {
        let scheduler = make_scheduler();
        let mut unusable = channel("a", 1, ChannelStatus::Active);
        unusable.credentials = ChannelCredentials::ApiKeys(vec![]);
        scheduler
            .set_channels(Family::Messages, vec![unusable, channel("b", 2, ChannelStatus::Active)])
            .await;
        let selection = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), None, "m")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "b");
    }

    #[tokio::test]
    async fn promotion_overrides_normal_priority_order() {
        let scheduler = make_scheduler();
        let mut promoted = channel("p", 5, ChannelStatus::Active);
        promoted.promotion_until = Some(OffsetDateTime::now_utc() + time::Duration::minutes(5));
        scheduler
            .set_channels(Family::Messages, vec![channel("a", 1, ChannelStatus::Active), promoted])
            .await;
        let selection = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), None, "m")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "p");
        assert_eq!(selection.reason, SelectionReason::Promotion);
    }

    #[tokio::test]
    async fn trace_affinity_is_honored_over_priority() {
        let scheduler = make_scheduler();
        scheduler
            .set_channels(
                Family::Messages,
                vec![channel("a", 1, ChannelStatus::Active), channel("b", 2, ChannelStatus::Active)],
            )
            .await;
        scheduler.trace_affinity.set_preferred("client-1", "b").await;
        let selection = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), None, "m")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "b");
        assert_eq!(selection.reason, SelectionReason::TraceAffinity);
    }

    #[tokio::test]
    async fn unhealthy_channel_falls_through_to_degraded() {
        let scheduler = make_scheduler();
        scheduler
            .set_channels(
                Family::Messages,
                vec![channel("a", 1, ChannelStatus::Active), channel("b", 2, ChannelStatus::Active)],
            )
            .await;
        for _ in 0..20 {
            scheduler.metrics.record_failure(Family::Messages, "a").await;
        }
        let selection = scheduler
            .select(Family::Messages, "client-1", &HashSet::new(), None, "m")
            .await
            .unwrap();
        assert_eq!(selection.channel_id, "b");
    }
}
