//! Component G — the request pipeline. Ties authentication, permission
//! enforcement, the scheduler, rate limiting, OAuth, and usage extraction
//! into the end-to-end per-request flow described in spec §4.G.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration as StdDuration;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use gatewayrs_common::Family;
use gatewayrs_health::{MetricsWindows, QuotaTracker};
use gatewayrs_oauth::{OAuthManager, RefreshConfig};
use gatewayrs_protocol::{InboundRequest, ProtocolConverter, UpstreamHttpRequest};
use gatewayrs_scheduler::ChannelCredentials;
use gatewayrs_ratelimit::{AuthFailureBrake, ChannelRateLimiter, ClientRateLimiter};
use gatewayrs_scheduler::{Channel, ChannelScheduler, Selection, SelectionReason};
use gatewayrs_storage::{RequestLogPatch, RequestLogRecord, RequestStatus, Storage, UsageTotals};
use gatewayrs_usage::UsageExtractor;
use http::HeaderMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::auth::{hash_client_identity, AuthContext, MemoryAuth};
use crate::classify::classify_request;
use crate::dispatch::{BodyStream, DispatchError, UpstreamClient, UpstreamStreamResponse};
use crate::error::{ErrorKind, GatewayError};

const MIRROR_BUFFER_CAP: usize = 10 * 1024 * 1024;
const DEFAULT_QUOTA_SUSPEND: StdDuration = StdDuration::from_secs(300);

pub struct PipelineDeps {
    pub scheduler: Arc<ChannelScheduler>,
    pub metrics: Arc<MetricsWindows>,
    pub quotas: Arc<QuotaTracker>,
    pub client_rate_limiter: Arc<ClientRateLimiter>,
    pub channel_rate_limiter: Arc<ChannelRateLimiter>,
    pub auth_brake: Arc<AuthFailureBrake>,
    pub oauth: Arc<OAuthManager>,
    pub auth: Arc<MemoryAuth>,
    pub protocol: Arc<dyn ProtocolConverter>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub storage: Arc<dyn Storage>,
    /// Gateway-wide RPM ceiling a per-key `rpm_limit` of 0 inherits (§3/§4.D).
    pub global_rpm: u32,
}

pub struct RequestPipeline {
    deps: PipelineDeps,
    max_attempts_cap: usize,
    oauth_refresh: RefreshConfig,
}

/// The end of a successful dispatch: headers are final, the body is a tee'd
/// stream the router forwards to the client while this struct's drop-free
/// `finish` obligation records the final outcome once the body is drained.
pub struct DispatchHandle {
    pub request_id: String,
    pub channel_id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: BodyStream,
}

pub enum PipelineOutcome {
    Dispatched(DispatchHandle),
    Exhausted(GatewayError),
}

impl RequestPipeline {
    pub fn new(deps: PipelineDeps, max_attempts_cap: usize, oauth_refresh: RefreshConfig) -> Arc<Self> {
        Arc::new(Self { deps, max_attempts_cap, oauth_refresh })
    }

    /// Runs steps 1-5 of §4.G: admission, authentication, permission
    /// enforcement, the pending log record, and the bounded attempt loop.
    /// Step 6 (finalize) is split across this method (on exhaustion) and
    /// [`Self::finish_success`] (called once the tee'd body is drained).
    pub async fn handle(
        self: &Arc<Self>,
        method: &http::Method,
        path: &str,
        headers: &HeaderMap,
        client_ip: &str,
        body: Bytes,
        requested_model: &str,
        stream: bool,
        session_id: Option<String>,
    ) -> Result<PipelineOutcome, GatewayError> {
        if self.deps.auth_brake.is_blocked(client_ip).await {
            return Err(GatewayError::rate_limited("ip temporarily blocked after repeated auth failures"));
        }

        let classified = classify_request(method, path)?;

        let auth = match self.deps.auth.authenticate(headers) {
            Ok(ctx) => {
                self.deps.auth_brake.record_success(client_ip).await;
                ctx
            }
            Err(err) => {
                self.deps.auth_brake.record_failure(client_ip).await;
                return Err(err);
            }
        };

        let admission_key = format!("key:{}", auth.key_id);
        let decision = self
            .deps
            .client_rate_limiter
            .check(&admission_key, auth.rpm_limit, self.deps.global_rpm)
            .await;
        if !decision.allowed {
            return Err(GatewayError::rate_limited_with_info(
                "client rate limit exceeded",
                crate::error::RateLimitInfo {
                    limit: decision.limit,
                    remaining: decision.remaining,
                    reset_at: decision.reset_at,
                },
            ));
        }

        self.enforce_permissions(&auth, &classified.endpoint, requested_model)?;
        let allowed_channels = auth.permissions.channels_for(classified.family).cloned();

        let request_id = uuid::Uuid::new_v4().to_string();
        let started_at = OffsetDateTime::now_utc();
        self.deps
            .storage
            .add(RequestLogRecord::new_pending(
                request_id.clone(),
                classified.family,
                classified.endpoint.clone(),
                requested_model.to_string(),
                auth.client_id.clone(),
                session_id.clone(),
                auth.key_id.clone(),
                started_at,
            ))
            .await
            .map_err(|err| GatewayError::new(ErrorKind::Internal, err.to_string()))?;

        let inbound = InboundRequest {
            family: classified.family,
            model: requested_model.to_string(),
            stream,
            session_id,
            body,
        };

        match self
            .attempt_loop(&request_id, &auth, classified.family, allowed_channels.as_ref(), &inbound)
            .await
        {
            Ok(handle) => Ok(PipelineOutcome::Dispatched(handle)),
            Err(err) => {
                self.finalize_error(&request_id, started_at, &err).await;
                Ok(PipelineOutcome::Exhausted(err))
            }
        }
    }

    fn enforce_permissions(
        &self,
        auth: &AuthContext,
        endpoint: &str,
        model: &str,
    ) -> Result<(), GatewayError> {
        if !auth.permissions.endpoint_allowed(endpoint) {
            return Err(GatewayError::forbidden(format!("endpoint {endpoint} not permitted")));
        }
        if !auth.permissions.model_allowed(model) {
            let base_allowed = gatewayrs_scheduler::strip_thinking_suffix(model)
                .is_some_and(|base| auth.permissions.model_allowed(base));
            if !base_allowed {
                return Err(GatewayError::forbidden(format!("model {model} not permitted")));
            }
        }
        Ok(())
    }

    async fn attempt_loop(
        self: &Arc<Self>,
        request_id: &str,
        auth: &AuthContext,
        family: Family,
        allowed_channels: Option<&HashSet<String>>,
        inbound: &InboundRequest,
    ) -> Result<DispatchHandle, GatewayError> {
        let client_hash = hash_client_identity(&auth.client_id);
        let mut failed_this_request: HashSet<String> = HashSet::new();
        let mut sticky: Option<Selection> = None;

        for _attempt in 0..self.max_attempts_cap.max(1) {
            let selection = if let Some(previous) = &sticky {
                match self.deps.scheduler.next_composite_failover(family, previous, &inbound.model).await {
                    Some(next) => next,
                    None => self.select(family, &client_hash, &failed_this_request, allowed_channels, &inbound.model).await?,
                }
            } else {
                self.select(family, &client_hash, &failed_this_request, allowed_channels, &inbound.model).await?
            };

            match self.dispatch_once(request_id, family, &selection, inbound).await {
                AttemptOutcome::Success(handle) => {
                    self.deps.scheduler.record_success(family, &selection.channel_id).await;
                    self.deps.scheduler.set_trace_affinity(&client_hash, &selection.channel_id).await;
                    self.deps.scheduler.update_trace_affinity(&client_hash).await;
                    self.deps.quotas.increment(family, &selection.channel_id, 1).await;
                    return Ok(handle);
                }
                AttemptOutcome::RetryableFailure => {
                    self.deps.scheduler.record_failure(family, &selection.channel_id).await;
                    failed_this_request.insert(selection.channel_id.clone());
                    sticky = if selection.remaining_chain.is_empty() { None } else { Some(selection) };
                }
            }
        }

        Err(GatewayError::new(ErrorKind::UpstreamFault, "all channels exhausted"))
    }

    async fn select(
        &self,
        family: Family,
        client_hash: &str,
        failed_this_request: &HashSet<String>,
        allowed_channels: Option<&HashSet<String>>,
        model: &str,
    ) -> Result<Selection, GatewayError> {
        self.deps
            .scheduler
            .select(family, client_hash, failed_this_request, allowed_channels, model)
            .await
            .map_err(|err| match err {
                gatewayrs_scheduler::SchedulerError::NoChannelsAfterPermissionFiltering => {
                    GatewayError::new(ErrorKind::ForbiddenNoChannelsAfterPermissionFiltering, "no channels after permission filtering")
                }
                gatewayrs_scheduler::SchedulerError::NoChannelsAvailable => {
                    GatewayError::new(ErrorKind::UpstreamFault, "no channels available")
                }
            })
    }

    async fn dispatch_once(
        self: &Arc<Self>,
        request_id: &str,
        family: Family,
        selection: &Selection,
        inbound: &InboundRequest,
    ) -> AttemptOutcome {
        tracing::debug!(
            request_id,
            channel = %selection.channel_id,
            reason = ?selection.reason,
            "dispatching attempt"
        );

        if let Err(acquire_err) = self.deps.channel_rate_limiter.acquire(family, &selection.channel_id).await {
            tracing::debug!(channel = %selection.channel_id, ?acquire_err, "channel rpm admission failed");
            return AttemptOutcome::RetryableFailure;
        }

        let Some(channel) = self.deps.scheduler.get_channel(family, &selection.channel_id).await else {
            tracing::warn!(channel = %selection.channel_id, "selected channel vanished from the registry mid-attempt");
            return AttemptOutcome::RetryableFailure;
        };

        let model_override = selection.resolved_model.as_deref().unwrap_or(&inbound.model);
        let mut upstream_request = match self
            .deps
            .protocol
            .build_upstream_request(&channel.base_url, family, inbound, Some(model_override))
        {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error = %err, "failed to build upstream request");
                return AttemptOutcome::RetryableFailure;
            }
        };

        if let Err(outcome) = self.authorize_upstream_request(&channel, &mut upstream_request).await {
            return outcome;
        }

        let response = match self.deps.upstream.send(upstream_request).await {
            Ok(response) => response,
            Err(DispatchError::Network(_) | DispatchError::TlsHandshake(_) | DispatchError::Truncated) => {
                return AttemptOutcome::RetryableFailure;
            }
        };

        if response.status >= 500 {
            return AttemptOutcome::RetryableFailure;
        }
        if is_quota_exhausted(&response) {
            let retry_after = parse_retry_after(&response.headers).unwrap_or(DEFAULT_QUOTA_SUSPEND);
            self.deps
                .quotas
                .set_suspended(family, &selection.channel_id, "quota exhausted", retry_after)
                .await;
            return AttemptOutcome::RetryableFailure;
        }

        let handle = self.build_success_handle(request_id, family, selection, response).await;
        AttemptOutcome::Success(handle)
    }

    /// Resolves the channel's credential into an `Authorization` header.
    /// Per-provider header shapes beyond this (e.g. Codex's
    /// `Chatgpt-Account-Id`) belong to the protocol-conversion collaborator
    /// (§6) and are out of scope here.
    async fn authorize_upstream_request(
        &self,
        channel: &Channel,
        upstream_request: &mut UpstreamHttpRequest,
    ) -> Result<(), AttemptOutcome> {
        match &channel.credentials {
            ChannelCredentials::ApiKeys(keys) => {
                let Some(key) = keys.first() else {
                    return Err(AttemptOutcome::RetryableFailure);
                };
                upstream_request.headers.insert("authorization".to_string(), format!("Bearer {key}"));
                Ok(())
            }
            ChannelCredentials::OAuth => {
                match self.deps.oauth.get_valid_token(&channel.id, &self.oauth_refresh).await {
                    Ok(outcome) => {
                        upstream_request
                            .headers
                            .insert("authorization".to_string(), format!("Bearer {}", outcome.access_token));
                        if outcome.persist_needed {
                            tracing::info!(channel = %channel.id, "oauth bundle refreshed, persistence deferred to storage wiring");
                        }
                        Ok(())
                    }
                    Err(err) => {
                        tracing::warn!(channel = %channel.id, error = ?err, "oauth refresh failed");
                        Err(AttemptOutcome::RetryableFailure)
                    }
                }
            }
            ChannelCredentials::Composite | ChannelCredentials::None => Err(AttemptOutcome::RetryableFailure),
        }
    }

    async fn build_success_handle(
        self: &Arc<Self>,
        request_id: &str,
        family: Family,
        selection: &Selection,
        response: UpstreamStreamResponse,
    ) -> DispatchHandle {
        let usage_extractor = Arc::new(Mutex::new(UsageExtractor::new(family)));
        let body = Box::pin(TeeBody {
            inner: response.body,
            usage: usage_extractor.clone(),
            mirror: BytesMut::new(),
            mirror_cap: MIRROR_BUFFER_CAP,
            finished: false,
            pipeline: self.clone(),
            request_id: request_id.to_string(),
            channel_id: selection.channel_id.clone(),
            started_at: OffsetDateTime::now_utc(),
            status: response.status,
        }) as BodyStream;

        DispatchHandle {
            request_id: request_id.to_string(),
            channel_id: selection.channel_id.clone(),
            status: response.status,
            headers: response.headers,
            body,
        }
    }

    async fn finalize_success(
        &self,
        request_id: &str,
        channel_id: &str,
        started_at: OffsetDateTime,
        status: u16,
        usage: &UsageExtractor,
    ) {
        let now = OffsetDateTime::now_utc();
        let usage_snapshot = usage.usage();
        let totals = UsageTotals {
            input_tokens: usage_snapshot.input_tokens,
            output_tokens: usage_snapshot.output_tokens,
            cache_creation_input_tokens: usage_snapshot.cache_creation_input_tokens,
            cache_read_input_tokens: usage_snapshot.cache_read_input_tokens,
        };
        let patch = RequestLogPatch {
            status: Some(RequestStatus::Completed),
            finished_at: Some(now),
            duration_ms: Some((now - started_at).whole_milliseconds() as i64),
            channel_id: Some(channel_id.to_string()),
            upstream_model: usage_snapshot.model.clone(),
            status_code: Some(status),
            usage: Some(totals),
            cost: None,
            error_kind: None,
            error_message: None,
        };
        if let Err(err) = self.deps.storage.update(request_id, patch).await {
            tracing::error!(error = %err, request_id, "failed to finalize completed request");
        }
    }

    async fn finalize_error(&self, request_id: &str, started_at: OffsetDateTime, err: &GatewayError) {
        let now = OffsetDateTime::now_utc();
        let patch = RequestLogPatch {
            status: Some(RequestStatus::Error),
            finished_at: Some(now),
            duration_ms: Some((now - started_at).whole_milliseconds() as i64),
            status_code: Some(err.status_code().as_u16()),
            error_kind: Some(format!("{:?}", err.kind)),
            error_message: Some(err.message.clone()),
            ..Default::default()
        };
        if let Err(storage_err) = self.deps.storage.update(request_id, patch).await {
            tracing::error!(error = %storage_err, request_id, "failed to finalize exhausted request");
        }
    }

    /// Periodic maintenance: stale-pending sweep, suspension sweep. Callers
    /// wire this into a ticker at bootstrap (analogous to the quota
    /// tracker's own sweeper).
    pub async fn run_cleanup_sweep(&self, stale_after: StdDuration) {
        match self.deps.storage.cleanup_stale_pending(time::Duration::try_from(stale_after).unwrap_or(time::Duration::ZERO)).await {
            Ok(count) if count > 0 => tracing::info!(count, "swept stale pending requests to timeout"),
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "stale-pending sweep failed"),
        }
        if let Err(err) = self.deps.storage.clear_expired_suspensions().await {
            tracing::error!(error = %err, "expired-suspension sweep failed");
        }
    }
}

enum AttemptOutcome {
    Success(DispatchHandle),
    RetryableFailure,
}

fn is_quota_exhausted(response: &UpstreamStreamResponse) -> bool {
    response.status == 429
}

fn parse_retry_after(headers: &HashMap<String, String>) -> Option<StdDuration> {
    let raw = headers.get("retry-after")?;
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(StdDuration::from_secs(secs));
    }
    None
}

/// Tees an upstream body to the caller while feeding the usage extractor
/// and a bounded mirror buffer (§4.G step 5). Finalization is dispatched as
/// a background task on stream end so `poll_next` stays synchronous.
struct TeeBody {
    inner: BodyStream,
    usage: Arc<Mutex<UsageExtractor>>,
    mirror: BytesMut,
    mirror_cap: usize,
    finished: bool,
    pipeline: Arc<RequestPipeline>,
    request_id: String,
    channel_id: String,
    started_at: OffsetDateTime,
    status: u16,
}

impl Stream for TeeBody {
    type Item = Result<Bytes, DispatchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.mirror.len() < this.mirror_cap {
                    let take = (this.mirror_cap - this.mirror.len()).min(chunk.len());
                    this.mirror.extend_from_slice(&chunk[..take]);
                }
                if let Ok(text) = std::str::from_utf8(&chunk) {
                    let usage = this.usage.clone();
                    let text = text.to_string();
                    // Usage parsing is synchronous CPU work; the async mutex
                    // only ever guards against a concurrent `finish_stream`.
                    if let Ok(mut guard) = usage.try_lock() {
                        guard.push_sse_chunk(&text);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    let pipeline = this.pipeline.clone();
                    let usage = this.usage.clone();
                    let request_id = this.request_id.clone();
                    let channel_id = this.channel_id.clone();
                    let started_at = this.started_at;
                    let status = this.status;
                    tokio::spawn(async move {
                        let mut guard = usage.lock().await;
                        guard.finish_stream();
                        pipeline.finalize_success(&request_id, &channel_id, started_at, status, &guard).await;
                    });
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use crate::auth::{ApiKeyEntry, AuthSnapshot};
    use gatewayrs_oauth::OAuthManager;
    use gatewayrs_protocol::{HttpMethod, ProtocolError, UpstreamHttpResponse};
    use gatewayrs_ratelimit::{AuthFailureBrake, ChannelRateLimiter, ClientRateLimiter};
    use gatewayrs_scheduler::{ChannelCredentials, ChannelStatus, ChannelScheduler};
    use gatewayrs_scheduler::TraceAffinityMap;
    use gatewayrs_storage::InMemoryStore;

    struct PassthroughConverter;

    impl ProtocolConverter for PassthroughConverter {
        fn build_upstream_request(
            &self,
            base_url: &str,
            _target_family: Family,
            req: &InboundRequest,
            _model_override: Option<&str>,
        ) -> Result<UpstreamHttpRequest, ProtocolError> {
            Ok(UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: format!("{base_url}/v1/messages"),
                headers: StdHashMap::new(),
                body: req.body.clone(),
                is_stream: req.stream,
            })
        }

        fn render_error(&self, _client_family: Family, status: u16, upstream_body: &[u8]) -> UpstreamHttpResponse {
            UpstreamHttpResponse { status, headers: StdHashMap::new(), body: Bytes::copy_from_slice(upstream_body) }
        }
    }

    /// Scripted upstream: returns a fixed status/body per base url, so
    /// each test wires up exactly the failure/success sequence spec §8's
    /// scenarios describe without a real network hop.
    struct ScriptedUpstream {
        responses: StdHashMap<String, (u16, &'static str)>,
    }

    #[async_trait::async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn send(&self, request: UpstreamHttpRequest) -> Result<UpstreamStreamResponse, DispatchError> {
            let (status, body) = self.responses.get(&request.url).copied().unwrap_or((404, ""));
            let chunk = Bytes::from_static(body.as_bytes());
            let stream = futures_util::stream::once(async move { Ok(chunk) });
            Ok(UpstreamStreamResponse { status, headers: StdHashMap::new(), body: Box::pin(stream) })
        }
    }

    fn test_channel(id: &str, base_url: &str, priority: i32) -> Channel {
        Channel {
            id: id.to_string(),
            family: Family::Messages,
            display_name: id.to_string(),
            service_type: "claude".to_string(),
            credentials: ChannelCredentials::ApiKeys(vec!["test-key".to_string()]),
            base_url: base_url.to_string(),
            priority,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: None,
            rpm_limit: 0,
            queue_enabled: false,
            queue_timeout: StdDuration::from_secs(0),
            composite_mappings: Vec::new(),
        }
    }

    async fn build_pipeline(channels: Vec<Channel>, responses: StdHashMap<String, (u16, &'static str)>) -> Arc<RequestPipeline> {
        let metrics = Arc::new(MetricsWindows::new());
        let quotas = Arc::new(QuotaTracker::new());
        let trace_affinity = Arc::new(TraceAffinityMap::new());
        let scheduler = Arc::new(ChannelScheduler::new(metrics.clone(), quotas.clone(), trace_affinity));
        scheduler.set_channels(Family::Messages, channels).await;

        let mut keys = StdHashMap::new();
        keys.insert(
            crate::auth::hash_api_key("caller-key"),
            ApiKeyEntry {
                key_id: "k1".to_string(),
                client_id: "client-1".to_string(),
                enabled: true,
                is_admin: false,
                rpm_limit: 0,
                permissions: Default::default(),
            },
        );
        keys.insert(
            crate::auth::hash_api_key("model-restricted-key"),
            ApiKeyEntry {
                key_id: "k2".to_string(),
                client_id: "client-2".to_string(),
                enabled: true,
                is_admin: false,
                rpm_limit: 0,
                permissions: gatewayrs_scheduler::ApiKeyPermissions {
                    allowed_models: vec!["m".to_string()],
                    ..Default::default()
                },
            },
        );
        let auth = Arc::new(MemoryAuth::new(AuthSnapshot { keys_by_value: keys }, None));

        let deps = PipelineDeps {
            scheduler,
            metrics,
            quotas: quotas.clone(),
            client_rate_limiter: Arc::new(ClientRateLimiter::new()),
            channel_rate_limiter: Arc::new(ChannelRateLimiter::new()),
            auth_brake: Arc::new(AuthFailureBrake::default()),
            oauth: Arc::new(OAuthManager::new()),
            auth,
            protocol: Arc::new(PassthroughConverter),
            upstream: Arc::new(ScriptedUpstream { responses }),
            storage: Arc::new(InMemoryStore::new()),
            global_rpm: 0,
        };
        RequestPipeline::new(deps, 4, RefreshConfig::default())
    }

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", http::HeaderValue::from_str(key).unwrap());
        headers
    }

    #[tokio::test]
    async fn failover_on_500_dispatches_to_second_channel() {
        let mut responses = StdHashMap::new();
        responses.insert("http://a/v1/messages".to_string(), (500u16, ""));
        responses.insert("http://b/v1/messages".to_string(), (200u16, r#"{"ok":true}"#));
        let pipeline = build_pipeline(
            vec![test_channel("chan-a", "http://a", 1), test_channel("chan-b", "http://b", 2)],
            responses,
        )
        .await;

        let outcome = pipeline
            .handle(
                &http::Method::POST,
                "/v1/messages",
                &headers_with_key("caller-key"),
                "203.0.113.1",
                Bytes::from_static(br#"{"model":"claude-haiku-4-5","stream":false}"#),
                "claude-haiku-4-5",
                false,
                None,
            )
            .await
            .expect("pipeline error");

        match outcome {
            PipelineOutcome::Dispatched(handle) => {
                assert_eq!(handle.channel_id, "chan-b");
                assert_eq!(handle.status, 200);
            }
            PipelineOutcome::Exhausted(err) => panic!("expected success, got {err:?}"),
        }
    }

    #[tokio::test]
    async fn all_channels_exhausted_surfaces_upstream_fault() {
        let mut responses = StdHashMap::new();
        responses.insert("http://a/v1/messages".to_string(), (500u16, ""));
        let pipeline = build_pipeline(vec![test_channel("chan-a", "http://a", 1)], responses).await;

        let outcome = pipeline
            .handle(
                &http::Method::POST,
                "/v1/messages",
                &headers_with_key("caller-key"),
                "203.0.113.1",
                Bytes::from_static(br#"{"model":"m","stream":false}"#),
                "m",
                false,
                None,
            )
            .await
            .expect("pipeline error");

        match outcome {
            PipelineOutcome::Exhausted(err) => assert_eq!(err.kind, ErrorKind::UpstreamFault),
            PipelineOutcome::Dispatched(_) => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn unknown_api_key_is_rejected_before_dispatch() {
        let pipeline = build_pipeline(vec![test_channel("chan-a", "http://a", 1)], StdHashMap::new()).await;

        let err = pipeline
            .handle(
                &http::Method::POST,
                "/v1/messages",
                &headers_with_key("not-a-real-key"),
                "203.0.113.1",
                Bytes::from_static(br#"{"model":"m"}"#),
                "m",
                false,
                None,
            )
            .await
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn thinking_suffix_model_falls_back_to_base_permission_check() {
        let mut responses = StdHashMap::new();
        responses.insert("chan-a".to_string(), (200, "{}"));
        let pipeline = build_pipeline(vec![test_channel("chan-a", "http://a", 1)], responses).await;

        let outcome = pipeline
            .handle(
                &http::Method::POST,
                "/v1/messages",
                &headers_with_key("model-restricted-key"),
                "203.0.113.1",
                Bytes::from_static(br#"{"model":"m(high)","stream":false}"#),
                "m(high)",
                false,
                None,
            )
            .await
            .expect("key allowed for m should be allowed for m(high) via base-model retry");

        match outcome {
            PipelineOutcome::Dispatched(_) => {}
            PipelineOutcome::Exhausted(err) => panic!("expected dispatch, got {err:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_model_is_still_forbidden_after_base_model_retry() {
        let pipeline = build_pipeline(vec![test_channel("chan-a", "http://a", 1)], StdHashMap::new()).await;

        let err = pipeline
            .handle(
                &http::Method::POST,
                "/v1/messages",
                &headers_with_key("model-restricted-key"),
                "203.0.113.1",
                Bytes::from_static(br#"{"model":"other(high)","stream":false}"#),
                "other(high)",
                false,
                None,
            )
            .await
            .expect_err("expected forbidden");
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }
}
