//! Read-only admin status surface (SPEC_FULL.md §6 supplement). CRUD over
//! channels/keys/pricing remains an external collaborator's concern; these
//! two endpoints only ever report state the scheduler/health/storage
//! components already hold, never mutate it.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gatewayrs_common::Family;
use gatewayrs_health::{MetricsWindows, QuotaTracker};
use gatewayrs_scheduler::ChannelScheduler;
use gatewayrs_storage::{Storage, StatsFilter};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AdminState {
    pub scheduler: Arc<ChannelScheduler>,
    pub metrics: Arc<MetricsWindows>,
    pub quotas: Arc<QuotaTracker>,
    pub storage: Arc<dyn Storage>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/channels", get(list_channels))
        .route("/admin/stats", get(stats))
        .with_state(state)
}

#[derive(Deserialize)]
struct FamilyQuery {
    family: String,
}

#[derive(Serialize)]
struct ChannelStatusView {
    id: String,
    display_name: String,
    service_type: String,
    priority: i32,
    status: String,
    rpm_limit: u32,
    failure_rate: f64,
    healthy: bool,
    quota: Option<QuotaView>,
}

#[derive(Serialize)]
struct QuotaView {
    limit: i64,
    used: i64,
    remaining: i64,
    remaining_percent: f64,
}

async fn list_channels(State(state): State<AdminState>, Query(q): Query<FamilyQuery>) -> Response {
    let Some(family) = parse_family(&q.family) else {
        return (axum::http::StatusCode::BAD_REQUEST, "unknown family").into_response();
    };

    let mut views = Vec::new();
    for channel in state.scheduler.list_channels(family).await {
        let failure_rate = state.metrics.failure_rate(family, &channel.id).await;
        let healthy = state.metrics.is_healthy(family, &channel.id).await;
        let quota = state.quotas.status(family, &channel.id).await.map(|s| QuotaView {
            limit: s.limit,
            used: s.used,
            remaining: s.remaining,
            remaining_percent: s.remaining_percent,
        });
        views.push(ChannelStatusView {
            id: channel.id,
            display_name: channel.display_name,
            service_type: channel.service_type,
            priority: channel.priority,
            status: format!("{:?}", channel.status),
            rpm_limit: channel.rpm_limit,
            failure_rate,
            healthy,
            quota,
        });
    }
    Json(views).into_response()
}

#[derive(Deserialize, Default)]
struct StatsQuery {
    provider: Option<String>,
    model: Option<String>,
    client_id: Option<String>,
    session_id: Option<String>,
    api_key_id: Option<String>,
}

async fn stats(State(state): State<AdminState>, Query(q): Query<StatsQuery>) -> Response {
    let filter = StatsFilter {
        from: None,
        to: None,
        provider: q.provider,
        model: q.model,
        client_id: q.client_id,
        session_id: q.session_id,
        api_key_id: q.api_key_id,
    };
    match state.storage.get_stats(filter).await {
        Ok(stats) => Json(stats_view(stats)).into_response(),
        Err(err) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Serialize)]
struct UsageStatsView {
    matched_requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: u64,
    cache_read_input_tokens: u64,
    total_cost: f64,
}

fn stats_view(stats: gatewayrs_storage::UsageStats) -> UsageStatsView {
    UsageStatsView {
        matched_requests: stats.matched_requests,
        input_tokens: stats.input_tokens,
        output_tokens: stats.output_tokens,
        cache_creation_input_tokens: stats.cache_creation_input_tokens,
        cache_read_input_tokens: stats.cache_read_input_tokens,
        total_cost: stats.total_cost,
    }
}

fn parse_family(raw: &str) -> Option<Family> {
    match raw {
        "messages" => Some(Family::Messages),
        "responses" => Some(Family::Responses),
        "gemini" => Some(Family::Gemini),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_family_rejects_unknown() {
        assert_eq!(parse_family("bogus"), None);
        assert_eq!(parse_family("gemini"), Some(Family::Gemini));
    }
}
