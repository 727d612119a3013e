//! Health, Metrics, and Ingest Endpoint
//!
//! HTTP surface consumed by container orchestrators, monitoring systems,
//! and upstream webhook producers.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health detail
//! - `GET /healthz` - liveness probe (process running)
//! - `GET /readyz` - readiness probe (event log reachable via joined
//!   consumers, cache live); existing connections keep serving last-known
//!   values while not ready
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /ingest/market-data` - publish an external market data update
//! - `POST /ingest/alerts` - publish an external alert trigger

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::envelope::{EventPayload, Topic};
use crate::infrastructure::cache::{NotifyHub, StateCache};
use crate::infrastructure::log::consumer::ConsumerStatus;
use crate::infrastructure::log::producer::{DeliveryError, ProducerGateway};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::ws::FanoutServer;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Per-topic consumer status.
    pub consumers: Vec<ConsumerInfo>,
    /// Active client connections.
    pub clients: ClientStatus,
    /// Fan-out listener statistics.
    pub subscriptions: SubscriptionStatus,
    /// Cache statistics.
    pub cache: CacheStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every consumer owns partitions and is making progress.
    Healthy,
    /// Some consumers are reconnecting or rebalancing.
    Degraded,
    /// No consumer can reach the event log.
    Unhealthy,
}

/// One consumer runner's status.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    /// Topic consumed.
    pub topic: String,
    /// Lifecycle state.
    pub state: String,
    /// Whether the runner owns partitions.
    pub ready: bool,
    /// Assigned partition count.
    pub partitions: usize,
    /// Events fetched and examined.
    pub consumed: u64,
    /// Malformed events skipped.
    pub skipped: u64,
    /// Events applied to the cache.
    pub applied: u64,
    /// Most recent transient error, if any.
    pub last_error: Option<String>,
}

/// Active client information.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Total active WebSocket connections.
    pub total: i32,
}

/// Fan-out listener statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    /// Total attached notification receivers.
    pub notify_receivers: usize,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Entries held, including expired ones not yet overwritten.
    pub entries: usize,
}

// =============================================================================
// Ingest Response Types
// =============================================================================

/// Successful ingest acknowledgment.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    /// Status marker.
    pub status: &'static str,
    /// Partition the event landed on.
    pub partition: u32,
    /// Committed offset.
    pub offset: u64,
}

/// Ingest rejection body.
#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    /// What was wrong with the request or delivery.
    pub error: String,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    consumers: Vec<Arc<ConsumerStatus>>,
    cache: Arc<StateCache>,
    hub: Arc<NotifyHub>,
    fanout: Arc<FanoutServer>,
    gateway: Arc<ProducerGateway>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        consumers: Vec<Arc<ConsumerStatus>>,
        cache: Arc<StateCache>,
        hub: Arc<NotifyHub>,
        fanout: Arc<FanoutServer>,
        gateway: Arc<ProducerGateway>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            consumers,
            cache,
            hub,
            fanout,
            gateway,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health server failure.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Could not bind the configured port.
    #[error("failed to bind health port {0}: {1}")]
    BindFailed(u16, String),
    /// The HTTP server failed while running.
    #[error("health server failed: {0}")]
    ServerFailed(String),
}

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");
        self.serve_with_listener(listener).await
    }

    /// Serve from an already-bound listener until cancelled.
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<(), HealthServerError> {
        let app = router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ingest/market-data", post(ingest_market_data_handler))
        .route("/ingest/alerts", post(ingest_alerts_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    // Ready when every consumer owns partitions, i.e. the event log is
    // reachable, and the cache handle is live. While not ready, existing
    // connections keep serving last-known cached values.
    let is_ready = state.consumers.iter().all(|status| status.is_ready());

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn ingest_market_data_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(payload): Json<EventPayload>,
) -> Response {
    ingest(&state, Topic::MarketTicks, payload).await
}

async fn ingest_alerts_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(payload): Json<EventPayload>,
) -> Response {
    ingest(&state, Topic::Alerts, payload).await
}

/// Publish an externally submitted payload through the producer gateway.
async fn ingest(state: &HealthServerState, topic: Topic, payload: EventPayload) -> Response {
    if payload.topic() != topic {
        let body = IngestError {
            error: format!(
                "payload {} does not belong on topic {topic}",
                payload.variant_name()
            ),
        };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    let key = payload.partition_key().to_string();
    match state.gateway.publish(topic, &key, &payload).await {
        Ok(meta) => (
            StatusCode::OK,
            Json(IngestResponse {
                status: "received",
                partition: meta.partition,
                offset: meta.offset,
            }),
        )
            .into_response(),
        Err(error) => {
            let status = match &error {
                DeliveryError::EmptyKey
                | DeliveryError::WrongTopic { .. }
                | DeliveryError::Serialization(_)
                | DeliveryError::InvalidBatchItem { .. } => StatusCode::BAD_REQUEST,
                DeliveryError::Rejected(_) | DeliveryError::Exhausted { .. } => {
                    StatusCode::BAD_GATEWAY
                }
            };
            tracing::warn!(topic = %topic, error = %error, "Ingest publish failed");
            (
                status,
                Json(IngestError {
                    error: error.to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let consumers: Vec<ConsumerInfo> = state
        .consumers
        .iter()
        .map(|status| ConsumerInfo {
            topic: status.topic().to_string(),
            state: status.state().as_str().to_string(),
            ready: status.is_ready(),
            partitions: status.partitions().len(),
            consumed: status.consumed(),
            skipped: status.skipped(),
            applied: status.applied(),
            last_error: status.last_error(),
        })
        .collect();

    let ready_count = consumers.iter().filter(|c| c.ready).count();
    let status = if ready_count == consumers.len() {
        HealthStatus::Healthy
    } else if ready_count > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        consumers,
        clients: ClientStatus {
            total: state.fanout.connection_count(),
        },
        subscriptions: SubscriptionStatus {
            notify_receivers: state.hub.stats().total_receivers(),
        },
        cache: CacheStatus {
            entries: state.cache.entry_count(),
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_from_consumer_readiness() {
        let all_ready = vec![
            Arc::new(ConsumerStatus::new(Topic::MarketTicks)),
            Arc::new(ConsumerStatus::new(Topic::RiskEvents)),
        ];
        // Fresh statuses are Stopped, so nothing is ready.
        assert!(all_ready.iter().all(|s| !s.is_ready()));
    }

    #[test]
    fn health_response_serializes() {
        let response = HealthResponse {
            status: HealthStatus::Degraded,
            version: "0.1.0".to_string(),
            uptime_secs: 12,
            current_time: Utc::now(),
            consumers: vec![ConsumerInfo {
                topic: "market-ticks".to_string(),
                state: "consuming".to_string(),
                ready: true,
                partitions: 3,
                consumed: 10,
                skipped: 1,
                applied: 8,
                last_error: None,
            }],
            clients: ClientStatus { total: 2 },
            subscriptions: SubscriptionStatus { notify_receivers: 4 },
            cache: CacheStatus { entries: 7 },
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["consumers"][0]["topic"], "market-ticks");
        assert_eq!(value["clients"]["total"], 2);
    }
}
