//! Record shapes for the request log store (§4.I). The persistence engine
//! itself — SQL dialect, schema migrations, connection pooling — is an
//! external collaborator; this crate only defines the contract and ships an
//! in-memory reference implementation for bootstrap and tests.

use gatewayrs_common::Family;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// A pending-through-completed request record. Created by `Add` at
/// `status=pending`, moved to a terminal status by `Update`.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub id: String,
    pub family: Family,
    pub endpoint: String,
    pub requested_model: String,
    pub client_id: String,
    pub session_id: Option<String>,
    pub api_key_id: String,
    pub status: RequestStatus,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub channel_id: Option<String>,
    pub upstream_model: Option<String>,
    pub status_code: Option<u16>,
    pub usage: Option<UsageTotals>,
    pub cost: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl RequestLogRecord {
    pub fn new_pending(
        id: impl Into<String>,
        family: Family,
        endpoint: impl Into<String>,
        requested_model: impl Into<String>,
        client_id: impl Into<String>,
        session_id: Option<String>,
        api_key_id: impl Into<String>,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            family,
            endpoint: endpoint.into(),
            requested_model: requested_model.into(),
            client_id: client_id.into(),
            session_id,
            api_key_id: api_key_id.into(),
            status: RequestStatus::Pending,
            started_at,
            finished_at: None,
            duration_ms: None,
            channel_id: None,
            upstream_model: None,
            status_code: None,
            usage: None,
            cost: None,
            error_kind: None,
            error_message: None,
        }
    }
}

/// Fields applied by `Update` when a record transitions out of `pending`.
#[derive(Debug, Clone, Default)]
pub struct RequestLogPatch {
    pub status: Option<RequestStatus>,
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub channel_id: Option<String>,
    pub upstream_model: Option<String>,
    pub status_code: Option<u16>,
    pub usage: Option<UsageTotals>,
    pub cost: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogQueryFilter {
    pub endpoint: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub status_min: Option<RequestStatus>,
    pub status_max: Option<RequestStatus>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQueryFilter {
    fn default() -> Self {
        Self {
            endpoint: None,
            client_id: None,
            session_id: None,
            status_min: None,
            status_max: None,
            from: None,
            to: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogQueryResult {
    pub rows: Vec<RequestLogRecord>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub api_key_id: Option<String>,
}

/// Aggregated over completed/error requests only — `pending` and `timeout`
/// never contribute real token/cost totals.
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub matched_requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
pub struct SessionActivity {
    pub session_id: String,
    pub client_id: String,
    pub provider: Option<String>,
    pub last_active_at: OffsetDateTime,
    pub request_count: u64,
}
