//! Infrastructure layer - Adapters and external integrations.

/// Identity and authorization adapters.
pub mod auth;

/// State cache and notification fan-out hub.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Health, metrics, and ingest HTTP surface.
pub mod health;

/// Event log adapters: producer gateway, consumer runner, retry policy.
pub mod log;

/// Prometheus metrics.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket subscription fan-out server.
pub mod ws;
