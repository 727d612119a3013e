//! Stream Relay Binary
//!
//! Starts the event distribution relay: consumer group runners, the
//! state cache bridge, the WebSocket fan-out server, and the health/ops
//! HTTP surface.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_RELAY_JWT_SECRET`: HS256 secret for client token verification
//!
//! ## Optional
//! - `STREAM_RELAY_WS_PORT`: fan-out WebSocket port (default: 8085)
//! - `STREAM_RELAY_HEALTH_PORT`: health/ingest HTTP port (default: 8086)
//! - `STREAM_RELAY_PORTFOLIO_GRANTS`: grant spec, e.g. `alice:P1,P2;bob:P3`
//! - `STREAM_RELAY_MAX_BATCH_SIZE`: records per consumer batch (default: 500)
//! - `STREAM_RELAY_HEARTBEAT_INTERVAL_SECS`: server ping interval (default: 30)
//! - `STREAM_RELAY_KEY_BUFFER_CAPACITY`: outbound frames per key (default: 16)
//! - `OTEL_ENABLED`: enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use stream_relay::infrastructure::telemetry;
use stream_relay::{
    ConsumerRunner, FanoutServer, HealthServer, HealthServerState, InMemoryEventLog,
    JwtIdentityVerifier, NotifyHub, ProducerGateway, RelayConfig, RetryPolicy, StateCache,
    StaticAccessPolicy, Topic, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Partitions per topic for the bundled in-memory log.
const LOG_PARTITIONS: u32 = 3;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting stream relay");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Shared pipeline state: the event log handle, the state cache, and
    // the notification hub are constructed once and passed down, never
    // reached for as globals.
    let event_log = Arc::new(InMemoryEventLog::new(LOG_PARTITIONS));
    let cache = Arc::new(StateCache::new());
    let hub = Arc::new(NotifyHub::new(&config.notify));

    let retry = RetryPolicy::from_settings(&config.retry);

    // Identity and authorization adapters
    let identity = Arc::new(JwtIdentityVerifier::new(config.auth.jwt_secret()));
    let access = Arc::new(
        config
            .auth
            .grants_spec
            .as_deref()
            .map_or_else(StaticAccessPolicy::new, StaticAccessPolicy::from_spec),
    );

    // Producer gateway, exposed to upstream producers via ingest routes
    let producer_log: Arc<dyn stream_relay::EventLogProducerPort> =
        Arc::clone(&event_log) as Arc<dyn stream_relay::EventLogProducerPort>;
    let gateway = Arc::new(ProducerGateway::new(
        producer_log,
        retry.clone(),
        config.publish.publish_timeout,
    ));

    // One consumer group runner per topic
    let mut consumer_statuses = Vec::new();
    for &topic in Topic::all() {
        let consumer_log: Arc<dyn stream_relay::EventLogConsumerPort> =
            Arc::clone(&event_log) as Arc<dyn stream_relay::EventLogConsumerPort>;
        let runner = ConsumerRunner::new(
            topic,
            consumer_log,
            Arc::clone(&cache),
            Arc::clone(&hub),
            config.cache.clone(),
            config.consumer.clone(),
            retry.clone(),
            shutdown_token.clone(),
        );
        consumer_statuses.push(runner.status());

        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!(topic = %topic, error = %e, "Consumer runner error");
            }
        });
    }

    // Fan-out server
    let fanout = Arc::new(FanoutServer::new(
        config.server.ws_port,
        Arc::clone(&cache),
        Arc::clone(&hub),
        identity,
        access,
        config.fanout.clone(),
        &config.auth,
        shutdown_token.clone(),
    ));

    let fanout_task = Arc::clone(&fanout);
    tokio::spawn(async move {
        if let Err(e) = fanout_task.run().await {
            tracing::error!(error = %e, "Fan-out server error");
        }
    });

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        consumer_statuses,
        Arc::clone(&cache),
        Arc::clone(&hub),
        fanout,
        gateway,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream relay ready");

    await_shutdown(shutdown_token).await;

    tracing::info!("Stream relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        max_batch_size = config.consumer.max_batch_size,
        heartbeat_secs = config.fanout.heartbeat_interval.as_secs(),
        key_buffer_capacity = config.fanout.key_buffer_capacity,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
