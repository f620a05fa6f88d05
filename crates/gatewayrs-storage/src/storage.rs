use async_trait::async_trait;
use gatewayrs_common::Family;
use time::{Duration, OffsetDateTime};

use crate::record::{
    LogQueryFilter, LogQueryResult, RequestLogPatch, RequestLogRecord, SessionActivity,
    StatsFilter, UsageStats,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Persisted suspension, mirroring the quota tracker's in-memory table so it
/// survives process restarts and is visible across a horizontally-scaled
/// deployment sharing one database.
#[derive(Debug, Clone)]
pub struct PersistedSuspension {
    pub until: OffsetDateTime,
    pub reason: String,
}

/// Thin persistence contract for the request log (§4.I). The concrete SQL
/// engine, schema, and migrations are an external collaborator — this trait
/// only names the operations the pipeline depends on.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn add(&self, record: RequestLogRecord) -> StorageResult<()>;
    async fn update(&self, id: &str, patch: RequestLogPatch) -> StorageResult<()>;
    async fn get_recent(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult>;
    async fn get_stats(&self, filter: StatsFilter) -> StorageResult<UsageStats>;
    async fn cleanup_stale_pending(&self, older_than: Duration) -> StorageResult<u64>;
    async fn get_active_sessions(&self, threshold: Duration) -> StorageResult<Vec<SessionActivity>>;

    async fn set_suspended(
        &self,
        family: Family,
        channel_id: &str,
        reason: &str,
        until: OffsetDateTime,
    ) -> StorageResult<()>;
    async fn is_suspended(
        &self,
        family: Family,
        channel_id: &str,
    ) -> StorageResult<Option<PersistedSuspension>>;
    /// The quota tracker's in-memory sweep counterpart: clears persisted
    /// suspension rows whose `until` has passed.
    async fn clear_expired_suspensions(&self) -> StorageResult<u64>;
}
