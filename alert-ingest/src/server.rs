use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use limiters::{
    ClientRateLimiter, ClientRateLimiterConfig, GlobalRateLimiter, InMemoryStore,
};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::middleware::auth::Authenticator;
use crate::middleware::rate_limit::RateLimiting;
use crate::middleware::timeout::TimeoutConfig;
use crate::processor::AlertProcessor;
use crate::prometheus::setup_metrics_recorder;
use crate::router::{self, AppState, Guards, IngestLimits};
use crate::sinks::http::HttpSink;
use crate::sinks::print::PrintSink;
use crate::sinks::AlertSink;
use crate::time::SystemTime;

// Window logs untouched for this long are dropped from the in-memory store
const RATE_LIMIT_MAX_IDLE: Duration = Duration::from_secs(600);
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn create_sink(config: &Config) -> anyhow::Result<Arc<dyn AlertSink>> {
    match &config.pipeline_url {
        Some(url) => {
            tracing::info!(url, "forwarding alerts to the processing pipeline");
            let sink = HttpSink::new(url.clone(), config.pipeline_timeout())
                .context("failed to build pipeline client")?;
            Ok(Arc::new(sink))
        }
        None => {
            tracing::warn!("PIPELINE_URL is not set, alerts will only be logged");
            Ok(Arc::new(PrintSink {}))
        }
    }
}

fn create_rate_limiting(config: &Config) -> Option<Arc<RateLimiting>> {
    if !config.rate_limit_enabled {
        tracing::info!("rate limiting disabled");
        return None;
    }

    let store = InMemoryStore::new();
    let cleanup = store.clone();
    tokio::spawn(async move {
        cleanup
            .clean_state(RATE_LIMIT_MAX_IDLE, RATE_LIMIT_CLEANUP_INTERVAL)
            .await;
    });

    let client = ClientRateLimiter::new(
        ClientRateLimiterConfig {
            threshold: config.client_rate_limit,
            window_interval: Duration::from_secs(config.client_rate_window_secs),
            ..Default::default()
        },
        Arc::new(store),
    );
    let global = GlobalRateLimiter::new(
        config.global_rate_limit,
        Duration::from_secs(config.global_rate_window_secs),
    );

    let known_clients = config.known_client_ids();
    tracing::info!(known_clients = known_clients.len(), "rate limiting enabled");

    Some(Arc::new(RateLimiting {
        client,
        global,
        known_clients,
    }))
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let limits = IngestLimits {
        max_body_bytes: config.max_body_bytes,
        max_alerts_per_request: config.max_alerts_per_request,
        body_chunk_timeout: config.body_chunk_timeout(),
    };

    let processor = Arc::new(AlertProcessor::new(
        create_sink(&config)?,
        config.processor(),
    ));

    let guards = Guards {
        rate_limiting: create_rate_limiting(&config),
        authenticator: Arc::new(Authenticator::from_mode(
            config.auth_mode,
            config.auth_token.as_deref(),
            config.hmac_secret.as_deref(),
            limits.max_body_bytes,
            limits.body_chunk_timeout,
        )?),
        timeouts: TimeoutConfig {
            request_timeout: config.request_timeout(),
            grace: config.timeout_grace(),
        },
    };

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let state = AppState {
        processor: processor.clone(),
        timesource: Arc::new(SystemTime {}),
        limits,
        rules: config.validation_rules(),
    };
    let app = router::router(state, guards, metrics);

    tracing::info!(
        "listening on {:?}",
        listener.local_addr().context("listener has no local address")?
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("http server failed")?;

    // In-flight requests are done, let queued alerts reach the sink
    processor.shutdown().await;
    tracing::info!("alert processor drained");

    Ok(())
}
