use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gatewayrs_core::{MemoryAuth, PipelineDeps, RequestPipeline};
use gatewayrs_health::{MetricsWindows, QuotaTracker};
use gatewayrs_oauth::{OAuthManager, RefreshConfig};
use gatewayrs_ratelimit::{AuthFailureBrake, ChannelRateLimiter, ClientRateLimiter};
use gatewayrs_scheduler::{ChannelScheduler, TraceAffinityMap};
use gatewayrs_storage::InMemoryStore;

mod cli;
mod config;
mod protocol;
mod upstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::CliArgs::parse();
    validate_access_key(&args)?;

    let file = config::load(&args.config)?;
    let channels = config::channels_by_family(&file);
    let auth_snapshot = config::auth_snapshot(&file);

    let metrics = Arc::new(MetricsWindows::new());
    let quotas = Arc::new(QuotaTracker::new());
    let trace_affinity = Arc::new(TraceAffinityMap::new());
    let scheduler = Arc::new(ChannelScheduler::new(metrics.clone(), quotas.clone(), trace_affinity));
    let channel_rate_limiter = Arc::new(ChannelRateLimiter::new());
    for (family, channels) in channels {
        for channel in &channels {
            if let Some(quota) = channel.quota {
                quotas.configure(family, &channel.id, quota).await;
            }
            if channel.rpm_limit > 0 {
                channel_rate_limiter
                    .configure(family, &channel.id, channel.rpm_limit, channel.queue_enabled, channel.queue_timeout)
                    .await;
            }
        }
        scheduler.set_channels(family, channels).await;
    }

    let client_rate_limiter = Arc::new(ClientRateLimiter::new());
    let auth_brake = Arc::new(AuthFailureBrake::default());
    let oauth = Arc::new(OAuthManager::new());
    let auth = Arc::new(MemoryAuth::new(auth_snapshot, args.access_key.clone()));
    let storage = Arc::new(InMemoryStore::new());

    let deps = PipelineDeps {
        scheduler,
        metrics,
        quotas: quotas.clone(),
        client_rate_limiter,
        channel_rate_limiter,
        auth_brake,
        oauth,
        auth,
        protocol: Arc::new(protocol::PassthroughProtocolConverter),
        upstream: Arc::new(upstream::WreqUpstreamClient::new()?),
        storage,
        global_rpm: args.global_rpm,
    };
    let admin_state = gatewayrs_router::AdminState {
        scheduler: deps.scheduler.clone(),
        metrics: deps.metrics.clone(),
        quotas: quotas.clone(),
        storage: deps.storage.clone(),
    };
    let pipeline = RequestPipeline::new(deps, 4, RefreshConfig::default());

    quotas.clone().spawn_sweeper();
    spawn_cleanup_sweeper(pipeline.clone());

    let app = gatewayrs_router::gateway_router(gatewayrs_router::AppState { pipeline })
        .merge(gatewayrs_router::admin_router(admin_state));

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
    Ok(())
}

fn validate_access_key(args: &cli::CliArgs) -> anyhow::Result<()> {
    const DEFAULT_KEY: &str = "changeme-default-key";
    let Some(key) = &args.access_key else { return Ok(()) };
    if key.len() < 16 {
        anyhow::bail!("PROXY_ACCESS_KEY must be at least 16 characters");
    }
    if key == DEFAULT_KEY && !args.allow_insecure_default_key {
        anyhow::bail!("refusing to start with the default access key outside development");
    }
    Ok(())
}

/// Periodically sweeps stale-pending request log rows to `timeout` and
/// clears expired persisted suspensions (§4.G cancellation note, §4.I).
fn spawn_cleanup_sweeper(pipeline: Arc<RequestPipeline>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            pipeline.run_cleanup_sweep(Duration::from_secs(300)).await;
        }
    });
}
