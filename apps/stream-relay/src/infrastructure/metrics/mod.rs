//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Pipeline**: events consumed, skipped, and applied per topic
//! - **Cache**: write outcomes (applied vs stale)
//! - **Fan-out**: connections, frames sent, frames dropped under load
//! - **Publishing**: retry counts at the producer gateway
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::envelope::Topic;
use crate::domain::interest::ChannelCategory;
use crate::infrastructure::cache::WriteOutcome;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_relay_events_consumed_total",
        "Total events fetched and examined per topic"
    );
    describe_counter!(
        "stream_relay_events_skipped_total",
        "Total malformed events skipped per topic"
    );
    describe_counter!(
        "stream_relay_cache_writes_total",
        "Total cache writes by outcome (applied vs stale)"
    );
    describe_counter!(
        "stream_relay_notifications_total",
        "Total notifications broadcast per channel category"
    );
    describe_counter!(
        "stream_relay_batches_committed_total",
        "Total batches whose offsets were committed per topic"
    );
    describe_counter!(
        "stream_relay_publish_retries_total",
        "Total publish retry attempts at the producer gateway"
    );

    describe_gauge!(
        "stream_relay_fanout_connections",
        "Number of active WebSocket client connections"
    );
    describe_counter!(
        "stream_relay_fanout_frames_sent_total",
        "Total frames delivered to WebSocket clients"
    );
    describe_counter!(
        "stream_relay_fanout_frames_dropped_total",
        "Total frames dropped by the per-key drop-oldest buffer policy"
    );
    describe_counter!(
        "stream_relay_subscribe_rejections_total",
        "Total rejected subscribe requests by reason"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an event fetched from the log.
pub fn record_event_consumed(topic: Topic) {
    counter!("stream_relay_events_consumed_total", "topic" => topic.as_str()).increment(1);
}

/// Record a malformed event skipped by the consumer.
pub fn record_event_skipped(topic: Topic) {
    counter!("stream_relay_events_skipped_total", "topic" => topic.as_str()).increment(1);
}

/// Record a cache write outcome.
pub fn record_cache_write(outcome: WriteOutcome) {
    let label = if outcome.is_applied() { "applied" } else { "stale" };
    counter!("stream_relay_cache_writes_total", "outcome" => label).increment(1);
}

/// Record a notification broadcast.
pub fn record_notification(category: ChannelCategory) {
    counter!("stream_relay_notifications_total", "category" => category.as_str()).increment(1);
}

/// Record a committed batch.
pub fn record_batch_committed(topic: Topic) {
    counter!("stream_relay_batches_committed_total", "topic" => topic.as_str()).increment(1);
}

/// Record a publish retry at the producer gateway.
pub fn record_publish_retry(topic: Topic) {
    counter!("stream_relay_publish_retries_total", "topic" => topic.as_str()).increment(1);
}

/// Update the active fan-out connection count.
pub fn set_fanout_connections(count: f64) {
    gauge!("stream_relay_fanout_connections").set(count);
}

/// Record a frame delivered to a client.
pub fn record_frame_sent(category: ChannelCategory) {
    counter!("stream_relay_fanout_frames_sent_total", "category" => category.as_str()).increment(1);
}

/// Record frames dropped by the per-key buffer policy.
pub fn record_frames_dropped(count: u64) {
    counter!("stream_relay_fanout_frames_dropped_total").increment(count);
}

/// Record a rejected subscribe request.
pub fn record_subscribe_rejected(reason: &'static str) {
    counter!("stream_relay_subscribe_rejections_total", "reason" => reason).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
