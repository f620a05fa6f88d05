//! In-memory reference implementation of [`Storage`], used for bootstrap
//! and tests. A real deployment points the pipeline at a SQL-backed
//! implementation instead; swapping it in is the persistence collaborator's
//! job, not this crate's.

use std::collections::HashMap;

use async_trait::async_trait;
use gatewayrs_common::Family;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::record::{
    LogQueryFilter, LogQueryResult, RequestLogPatch, RequestLogRecord, RequestStatus,
    SessionActivity, StatsFilter, UsageStats,
};
use crate::storage::{PersistedSuspension, Storage, StorageError, StorageResult};

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, RequestLogRecord>>,
    order: RwLock<Vec<String>>,
    suspensions: RwLock<HashMap<(Family, String), PersistedSuspension>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn status_rank(status: RequestStatus) -> u8 {
    match status {
        RequestStatus::Pending => 0,
        RequestStatus::Completed => 1,
        RequestStatus::Error => 2,
        RequestStatus::Timeout => 3,
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn add(&self, record: RequestLogRecord) -> StorageResult<()> {
        let id = record.id.clone();
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(StorageError::Backend(format!("duplicate request id {id}")));
        }
        records.insert(id.clone(), record);
        drop(records);
        self.order.write().await.push(id);
        Ok(())
    }

    async fn update(&self, id: &str, patch: RequestLogPatch) -> StorageResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if let Some(status) = patch.status {
            record.status = status;
        }
        if patch.finished_at.is_some() {
            record.finished_at = patch.finished_at;
        }
        if patch.duration_ms.is_some() {
            record.duration_ms = patch.duration_ms;
        }
        if patch.channel_id.is_some() {
            record.channel_id = patch.channel_id;
        }
        if patch.upstream_model.is_some() {
            record.upstream_model = patch.upstream_model;
        }
        if patch.status_code.is_some() {
            record.status_code = patch.status_code;
        }
        if patch.usage.is_some() {
            record.usage = patch.usage;
        }
        if patch.cost.is_some() {
            record.cost = patch.cost;
        }
        if patch.error_kind.is_some() {
            record.error_kind = patch.error_kind;
        }
        if patch.error_message.is_some() {
            record.error_message = patch.error_message;
        }
        Ok(())
    }

    async fn get_recent(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult> {
        let records = self.records.read().await;
        let order = self.order.read().await;

        let mut matched: Vec<&RequestLogRecord> = order
            .iter()
            .rev()
            .filter_map(|id| records.get(id))
            .filter(|r| filter.endpoint.as_deref().is_none_or(|e| r.endpoint == e))
            .filter(|r| filter.client_id.as_deref().is_none_or(|c| r.client_id == c))
            .filter(|r| filter.session_id.is_none() || r.session_id == filter.session_id)
            .filter(|r| {
                filter.status_min.is_none_or(|min| status_rank(r.status) >= status_rank(min))
            })
            .filter(|r| {
                filter.status_max.is_none_or(|max| status_rank(r.status) <= status_rank(max))
            })
            .filter(|r| filter.from.is_none_or(|from| r.started_at >= from))
            .filter(|r| filter.to.is_none_or(|to| r.started_at <= to))
            .collect();

        matched.sort_by_key(|r| std::cmp::Reverse(r.started_at));

        let total = matched.len();
        let page: Vec<RequestLogRecord> = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        let has_more = filter.offset + page.len() < total;

        Ok(LogQueryResult { rows: page, has_more })
    }

    async fn get_stats(&self, filter: StatsFilter) -> StorageResult<UsageStats> {
        let records = self.records.read().await;
        let mut stats = UsageStats::default();

        for record in records.values() {
            if matches!(record.status, RequestStatus::Pending | RequestStatus::Timeout) {
                continue;
            }
            if filter.from.is_some_and(|from| record.started_at < from) {
                continue;
            }
            if filter.to.is_some_and(|to| record.started_at > to) {
                continue;
            }
            if filter.provider.as_deref().is_some_and(|p| record.channel_id.as_deref() != Some(p))
            {
                continue;
            }
            if filter.model.as_deref().is_some_and(|m| record.requested_model != m) {
                continue;
            }
            if filter.client_id.as_deref().is_some_and(|c| record.client_id != c) {
                continue;
            }
            if filter.session_id.is_some() && record.session_id != filter.session_id {
                continue;
            }
            if filter.api_key_id.as_deref().is_some_and(|k| record.api_key_id != k) {
                continue;
            }

            stats.matched_requests += 1;
            if let Some(usage) = &record.usage {
                stats.input_tokens += usage.input_tokens;
                stats.output_tokens += usage.output_tokens;
                stats.cache_creation_input_tokens += usage.cache_creation_input_tokens;
                stats.cache_read_input_tokens += usage.cache_read_input_tokens;
            }
            stats.total_cost += record.cost.unwrap_or(0.0);
        }

        Ok(stats)
    }

    async fn cleanup_stale_pending(&self, older_than: Duration) -> StorageResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut records = self.records.write().await;
        let mut transitioned = 0u64;
        for record in records.values_mut() {
            if record.status == RequestStatus::Pending && now - record.started_at > older_than {
                record.status = RequestStatus::Timeout;
                record.finished_at = Some(now);
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    async fn get_active_sessions(&self, threshold: Duration) -> StorageResult<Vec<SessionActivity>> {
        let now = OffsetDateTime::now_utc();
        let records = self.records.read().await;

        let mut by_session: HashMap<String, SessionActivity> = HashMap::new();
        let mut ordered: Vec<&RequestLogRecord> = records.values().collect();
        ordered.sort_by_key(|r| r.started_at);

        for record in ordered {
            let Some(session_id) = &record.session_id else { continue };
            let at = record.finished_at.unwrap_or(record.started_at);
            if now - at > threshold {
                continue;
            }
            let entry = by_session.entry(session_id.clone()).or_insert_with(|| SessionActivity {
                session_id: session_id.clone(),
                client_id: record.client_id.clone(),
                provider: None,
                last_active_at: at,
                request_count: 0,
            });
            entry.request_count += 1;
            if at >= entry.last_active_at {
                entry.last_active_at = at;
                if record.status == RequestStatus::Completed {
                    entry.provider = record.channel_id.clone();
                }
            }
        }

        let mut sessions: Vec<SessionActivity> = by_session.into_values().collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_active_at));
        Ok(sessions)
    }

    async fn set_suspended(
        &self,
        family: Family,
        channel_id: &str,
        reason: &str,
        until: OffsetDateTime,
    ) -> StorageResult<()> {
        self.suspensions
            .write()
            .await
            .insert((family, channel_id.to_string()), PersistedSuspension {
                until,
                reason: reason.to_string(),
            });
        Ok(())
    }

    async fn is_suspended(
        &self,
        family: Family,
        channel_id: &str,
    ) -> StorageResult<Option<PersistedSuspension>> {
        Ok(self.suspensions.read().await.get(&(family, channel_id.to_string())).cloned())
    }

    async fn clear_expired_suspensions(&self) -> StorageResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut suspensions = self.suspensions.write().await;
        let before = suspensions.len();
        suspensions.retain(|_, s| s.until > now);
        Ok((before - suspensions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestLogRecord;

    fn sample(id: &str, status: RequestStatus, started_at: OffsetDateTime) -> RequestLogRecord {
        let mut record = RequestLogRecord::new_pending(
            id,
            Family::Messages,
            "/v1/messages",
            "claude-sonnet-4-5",
            "client-a",
            Some("session-1".into()),
            "key-1",
            started_at,
        );
        record.status = status;
        record
    }

    #[tokio::test]
    async fn add_then_update_transitions_status() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        store.add(sample("r1", RequestStatus::Pending, now)).await.unwrap();

        store
            .update(
                "r1",
                RequestLogPatch {
                    status: Some(RequestStatus::Completed),
                    duration_ms: Some(120),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = store.get_recent(LogQueryFilter::default()).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].status, RequestStatus::Completed);
        assert_eq!(result.rows[0].duration_ms, Some(120));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        store.add(sample("dup", RequestStatus::Pending, now)).await.unwrap();
        let err = store.add(sample("dup", RequestStatus::Pending, now)).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[tokio::test]
    async fn cleanup_stale_pending_marks_timeout() {
        let store = InMemoryStore::new();
        let old = OffsetDateTime::now_utc() - Duration::minutes(10);
        store.add(sample("stale", RequestStatus::Pending, old)).await.unwrap();

        let transitioned = store.cleanup_stale_pending(Duration::minutes(5)).await.unwrap();
        assert_eq!(transitioned, 1);

        let result = store.get_recent(LogQueryFilter::default()).await.unwrap();
        assert_eq!(result.rows[0].status, RequestStatus::Timeout);
    }

    #[tokio::test]
    async fn stats_exclude_pending_and_timeout() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let mut completed = sample("c1", RequestStatus::Completed, now);
        completed.usage = Some(crate::record::UsageTotals {
            input_tokens: 10,
            output_tokens: 20,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        });
        store.add(completed).await.unwrap();
        store.add(sample("p1", RequestStatus::Pending, now)).await.unwrap();
        store.add(sample("t1", RequestStatus::Timeout, now)).await.unwrap();

        let stats = store.get_stats(StatsFilter::default()).await.unwrap();
        assert_eq!(stats.matched_requests, 1);
        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.output_tokens, 20);
    }

    #[tokio::test]
    async fn suspension_round_trip_and_expiry() {
        let store = InMemoryStore::new();
        let until = OffsetDateTime::now_utc() + Duration::minutes(5);
        store.set_suspended(Family::Messages, "chan-a", "quota exhausted", until).await.unwrap();

        let found = store.is_suspended(Family::Messages, "chan-a").await.unwrap();
        assert!(found.is_some());

        let expired_until = OffsetDateTime::now_utc() - Duration::minutes(1);
        store.set_suspended(Family::Messages, "chan-b", "expired", expired_until).await.unwrap();
        let cleared = store.clear_expired_suspensions().await.unwrap();
        assert_eq!(cleared, 1);
        assert!(store.is_suspended(Family::Messages, "chan-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_sessions_respect_threshold() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let mut recent = sample("recent", RequestStatus::Completed, now);
        recent.finished_at = Some(now);
        recent.channel_id = Some("chan-a".into());
        store.add(recent).await.unwrap();

        let mut stale = sample("stale", RequestStatus::Completed, now - Duration::hours(2));
        stale.session_id = Some("session-2".into());
        stale.finished_at = Some(now - Duration::hours(2));
        store.add(stale).await.unwrap();

        let sessions = store.get_active_sessions(Duration::minutes(30)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "session-1");
        assert_eq!(sessions[0].provider.as_deref(), Some("chan-a"));
    }
}
