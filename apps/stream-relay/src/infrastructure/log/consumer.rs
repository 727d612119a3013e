//! Consumer Group Runner
//!
//! Drains one topic's partitions in order and applies each event as
//! "latest wins" into the state cache, committing progress only after a
//! whole fetched batch has been applied. A crash mid-batch therefore
//! causes safe re-processing, never offset loss; the cache's offset-marker
//! compare-and-set makes re-application idempotent.
//!
//! State machine per runner:
//!
//! ```text
//! Stopped -> Connecting -> Joined -> Consuming -> Rebalancing -> Joined -> ... -> Stopped
//! ```
//!
//! Failure handling:
//! - decode errors are logged and the single event is skipped (poison-pill
//!   isolation) so a malformed event never stalls its partition;
//! - transient log failures halt the batch and retry it with backoff,
//!   since skipping would silently lose a state update;
//! - revoked partitions abandon uncommitted progress and rejoin.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::application::ports::event_log::{
    CommittedOffsets, EventLogConsumerPort, LogError, LogRecord,
};
use crate::domain::envelope::{EventEnvelope, EventPayload, OffsetMarker, Topic};
use crate::domain::interest::InterestKey;
use crate::infrastructure::cache::{Notification, NotifyHub, StateCache};
use crate::infrastructure::config::{CacheTtlSettings, ConsumerSettings};
use crate::infrastructure::log::retry::RetryPolicy;
use crate::infrastructure::metrics;

// =============================================================================
// Consumer State
// =============================================================================

/// Lifecycle state of a consumer runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not running.
    Stopped,
    /// Joining the consumer group.
    Connecting,
    /// Member of the group with partitions assigned.
    Joined,
    /// Pulling and applying batches.
    Consuming,
    /// Partitions revoked; rejoining.
    Rebalancing,
}

impl ConsumerState {
    /// State name for logs and health reporting.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Joined => "joined",
            Self::Consuming => "consuming",
            Self::Rebalancing => "rebalancing",
        }
    }

    /// Whether the runner currently owns partitions and can make progress.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Joined | Self::Consuming)
    }
}

// =============================================================================
// Consumer Status
// =============================================================================

/// Shared, observable status of one topic runner.
///
/// Consumed by the health surface for readiness reporting.
#[derive(Debug)]
pub struct ConsumerStatus {
    topic: Topic,
    state: RwLock<ConsumerState>,
    partitions: RwLock<Vec<u32>>,
    consumed: AtomicU64,
    skipped: AtomicU64,
    applied: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl ConsumerStatus {
    pub(crate) fn new(topic: Topic) -> Self {
        Self {
            topic,
            state: RwLock::new(ConsumerState::Stopped),
            partitions: RwLock::new(Vec::new()),
            consumed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Topic this runner consumes.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.read()
    }

    /// Whether the runner owns partitions and can make progress.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Currently assigned partitions.
    #[must_use]
    pub fn partitions(&self) -> Vec<u32> {
        self.partitions.read().clone()
    }

    /// Events fetched and examined.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Malformed events skipped.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Events that changed the cache and were fanned out.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Most recent transient error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.write() = state;
        if state.is_ready() {
            *self.last_error.write() = None;
        }
    }

    fn set_partitions(&self, partitions: Vec<u32>) {
        *self.partitions.write() = partitions;
    }

    fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Unrecoverable runner failure.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Could not join the consumer group within the attempt cap.
    #[error("failed to join group {group} for topic {topic}: {source}")]
    JoinFailed {
        /// Consumer group identity.
        group: String,
        /// Topic being joined.
        topic: Topic,
        /// Final failure.
        #[source]
        source: LogError,
    },
}

enum Interrupt {
    Cancelled,
    Rejoin,
}

// =============================================================================
// Consumer Runner
// =============================================================================

/// One consumer-group member draining one topic into the state cache.
pub struct ConsumerRunner {
    topic: Topic,
    group: String,
    log: Arc<dyn EventLogConsumerPort>,
    cache: Arc<StateCache>,
    hub: Arc<NotifyHub>,
    ttls: CacheTtlSettings,
    settings: ConsumerSettings,
    retry: RetryPolicy,
    status: Arc<ConsumerStatus>,
    cancel: CancellationToken,
}

impl ConsumerRunner {
    /// Create a runner for `topic` using its own consumer group identity.
    #[must_use]
    pub fn new(
        topic: Topic,
        log: Arc<dyn EventLogConsumerPort>,
        cache: Arc<StateCache>,
        hub: Arc<NotifyHub>,
        ttls: CacheTtlSettings,
        settings: ConsumerSettings,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic,
            group: topic.consumer_group().to_string(),
            log,
            cache,
            hub,
            ttls,
            settings,
            retry,
            status: Arc::new(ConsumerStatus::new(topic)),
            cancel,
        }
    }

    /// Shared status handle for health reporting.
    #[must_use]
    pub fn status(&self) -> Arc<ConsumerStatus> {
        Arc::clone(&self.status)
    }

    /// Run until cancelled.
    ///
    /// The stop signal is observed between batches, never mid-batch, to
    /// preserve the no-partial-commit guarantee.
    pub async fn run(self) -> Result<(), ConsumerError> {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.status.set_state(ConsumerState::Connecting);
            let Some(assignment) = self.join_with_retry().await? else {
                break;
            };

            self.status.set_state(ConsumerState::Joined);
            self.status.set_partitions(assignment.partitions.clone());
            tracing::info!(
                topic = %self.topic,
                group = %self.group,
                partitions = assignment.partitions.len(),
                "Consumer joined group"
            );

            match self.consume_until_interrupted().await {
                Interrupt::Cancelled => break,
                Interrupt::Rejoin => {
                    self.status.set_state(ConsumerState::Rebalancing);
                    self.status.set_partitions(Vec::new());
                    tracing::info!(topic = %self.topic, "Partitions revoked, rejoining");
                }
            }
        }

        // Drain with a bounded grace period, then disconnect.
        let _ = tokio::time::timeout(
            self.settings.shutdown_grace,
            self.log.leave(&self.group, self.topic),
        )
        .await;
        self.status.set_state(ConsumerState::Stopped);
        tracing::info!(topic = %self.topic, "Consumer stopped");
        Ok(())
    }

    /// Join the group, retrying transient failures up to the attempt cap.
    ///
    /// Returns `None` when cancelled while waiting.
    async fn join_with_retry(&self) -> Result<Option<crate::application::ports::event_log::Assignment>, ConsumerError> {
        let mut backoff = self.retry.backoff();

        loop {
            match self.log.join(&self.group, self.topic).await {
                Ok(assignment) => return Ok(Some(assignment)),
                Err(error) if error.is_transient() || matches!(error, LogError::Rebalanced) => {
                    self.status.set_error(error.to_string());
                    let Some(delay) = backoff.next_delay() else {
                        return Err(ConsumerError::JoinFailed {
                            group: self.group.clone(),
                            topic: self.topic,
                            source: error,
                        });
                    };

                    tracing::warn!(
                        topic = %self.topic,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Join attempt failed, retrying"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    return Err(ConsumerError::JoinFailed {
                        group: self.group.clone(),
                        topic: self.topic,
                        source: error,
                    });
                }
            }
        }
    }

    /// Consume batches until cancelled or the assignment is revoked.
    async fn consume_until_interrupted(&self) -> Interrupt {
        loop {
            if self.cancel.is_cancelled() {
                return Interrupt::Cancelled;
            }

            self.status.set_state(ConsumerState::Consuming);

            let batch = match self.poll_with_backoff().await {
                Ok(batch) => batch,
                Err(interrupt) => return interrupt,
            };

            if batch.is_empty() {
                tokio::select! {
                    () = self.cancel.cancelled() => return Interrupt::Cancelled,
                    () = tokio::time::sleep(self.settings.poll_idle_delay) => {}
                }
                continue;
            }

            let offsets = self.apply_batch(&batch);

            // Offsets move only after every record of the batch is applied.
            if let Err(interrupt) = self.commit_with_backoff(&offsets).await {
                return interrupt;
            }
            metrics::record_batch_committed(self.topic);
        }
    }

    /// Apply a fetched batch to the cache, fanning out actual changes.
    ///
    /// Returns the offsets to commit: one past the highest applied record
    /// per partition.
    fn apply_batch(&self, batch: &[LogRecord]) -> CommittedOffsets {
        let mut offsets = CommittedOffsets::new();

        for record in batch {
            match EventPayload::decode(self.topic, &record.payload) {
                Err(error) => {
                    // Poison-pill isolation: the one event is dropped, the
                    // partition keeps moving.
                    tracing::warn!(
                        topic = %self.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %error,
                        "Skipping undecodable event"
                    );
                    self.status.skipped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_skipped(self.topic);
                }
                Ok(payload) => {
                    let envelope = EventEnvelope {
                        topic: self.topic,
                        partition_key: record.key.clone(),
                        offset: OffsetMarker::new(record.offset),
                        produced_at: record.produced_at,
                        payload,
                    };
                    let key = InterestKey::of(&envelope.payload);
                    let ttl = self.ttls.for_category(key.category());

                    let outcome = self.cache.write(
                        key.clone(),
                        envelope.payload.clone(),
                        envelope.offset,
                        ttl,
                        envelope.produced_at,
                    );
                    metrics::record_cache_write(outcome);

                    if outcome.is_applied() {
                        metrics::record_notification(key.category());
                        let _ = self.hub.publish(Notification {
                            key,
                            payload: envelope.payload,
                            marker: envelope.offset,
                            produced_at: envelope.produced_at,
                        });
                        self.status.applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            self.status.consumed.fetch_add(1, Ordering::Relaxed);
            metrics::record_event_consumed(self.topic);

            let next = record.offset + 1;
            offsets
                .entry(record.partition)
                .and_modify(|offset| *offset = (*offset).max(next))
                .or_insert(next);
        }

        offsets
    }

    async fn poll_with_backoff(&self) -> Result<Vec<LogRecord>, Interrupt> {
        let mut backoff = self.retry.backoff();

        loop {
            match self
                .log
                .poll(&self.group, self.topic, self.settings.max_batch_size)
                .await
            {
                Ok(batch) => return Ok(batch),
                Err(LogError::Rebalanced) => return Err(Interrupt::Rejoin),
                Err(error) if error.is_transient() => {
                    self.status.set_error(error.to_string());
                    // The batch is never skipped; retry for as long as the
                    // outage lasts, with the delay capped by the policy.
                    let delay = backoff.next_delay_uncapped();
                    tracing::warn!(
                        topic = %self.topic,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Poll failed, backing off"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    tracing::warn!(topic = %self.topic, error = %error, "Poll rejected, rejoining");
                    return Err(Interrupt::Rejoin);
                }
            }
        }
    }

    async fn commit_with_backoff(&self, offsets: &CommittedOffsets) -> Result<(), Interrupt> {
        let mut backoff = self.retry.backoff();

        loop {
            match self.log.commit(&self.group, self.topic, offsets).await {
                Ok(()) => return Ok(()),
                Err(LogError::Rebalanced) => return Err(Interrupt::Rejoin),
                Err(error) if error.is_transient() => {
                    self.status.set_error(error.to_string());
                    let delay = backoff.next_delay_uncapped();
                    tracing::warn!(
                        topic = %self.topic,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Commit failed, backing off"
                    );
                    tokio::select! {
                        // Cancelling here leaves the batch uncommitted; it
                        // is redelivered and reapplied idempotently.
                        () = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    tracing::warn!(topic = %self.topic, error = %error, "Commit rejected, rejoining");
                    return Err(Interrupt::Rejoin);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::envelope::{MarketTick, SCHEMA_VERSION};
    use crate::domain::interest::ChannelCategory;
    use crate::infrastructure::log::memory::InMemoryEventLog;

    fn tick_bytes(symbol: &str, price: &str) -> Vec<u8> {
        EventPayload::MarketTick(MarketTick {
            schema_version: SCHEMA_VERSION,
            symbol: symbol.to_string(),
            price: Decimal::from_str(price).unwrap(),
            volume: 0,
            bid: None,
            ask: None,
        })
        .encode()
        .unwrap()
    }

    fn record(partition: u32, offset: u64, key: &str, payload: Vec<u8>) -> LogRecord {
        LogRecord {
            partition,
            offset,
            key: key.to_string(),
            payload,
            produced_at: Utc::now(),
        }
    }

    fn runner(log: Arc<InMemoryEventLog>, cancel: CancellationToken) -> ConsumerRunner {
        let settings = ConsumerSettings {
            max_batch_size: 100,
            poll_idle_delay: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(200),
        };
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        ConsumerRunner::new(
            Topic::MarketTicks,
            log,
            Arc::new(StateCache::new()),
            Arc::new(NotifyHub::with_defaults()),
            CacheTtlSettings::default(),
            settings,
            retry,
            cancel,
        )
    }

    #[tokio::test]
    async fn apply_batch_writes_cache_and_notifies_changes() {
        let runner = runner(Arc::new(InMemoryEventLog::new(1)), CancellationToken::new());
        let mut rx = runner.hub.subscribe(ChannelCategory::Ticks);

        let batch = vec![
            record(0, 101, "AAPL", tick_bytes("AAPL", "178.50")),
            record(0, 102, "AAPL", tick_bytes("AAPL", "179.00")),
        ];
        let offsets = runner.apply_batch(&batch);

        assert_eq!(offsets.get(&0), Some(&103));
        assert_eq!(runner.status.consumed(), 2);
        assert_eq!(runner.status.applied(), 2);

        // Both changes fanned out, in offset order.
        assert_eq!(rx.recv().await.unwrap().marker, OffsetMarker::new(101));
        assert_eq!(rx.recv().await.unwrap().marker, OffsetMarker::new(102));

        let cached = runner
            .cache
            .read(&InterestKey::Tick("AAPL".to_string()))
            .unwrap();
        assert_eq!(cached.marker, OffsetMarker::new(102));
    }

    #[tokio::test]
    async fn redelivered_older_event_is_not_notified() {
        let runner = runner(Arc::new(InMemoryEventLog::new(1)), CancellationToken::new());
        let mut rx = runner.hub.subscribe(ChannelCategory::Ticks);

        runner.apply_batch(&[record(0, 50, "AAPL", tick_bytes("AAPL", "100.00"))]);

        // Out-of-order redelivery of an older event for the same key.
        runner.apply_batch(&[record(0, 49, "AAPL", tick_bytes("AAPL", "99.00"))]);

        assert_eq!(rx.recv().await.unwrap().marker, OffsetMarker::new(50));
        assert!(rx.try_recv().is_err());

        let cached = runner
            .cache
            .read(&InterestKey::Tick("AAPL".to_string()))
            .unwrap();
        assert_eq!(cached.marker, OffsetMarker::new(50));
    }

    #[tokio::test]
    async fn reprocessing_a_batch_after_crash_is_idempotent() {
        let runner = runner(Arc::new(InMemoryEventLog::new(1)), CancellationToken::new());
        let mut rx = runner.hub.subscribe(ChannelCategory::Ticks);

        let batch = vec![record(0, 10, "AAPL", tick_bytes("AAPL", "150.00"))];

        // First application, then the same batch again as after a crash
        // between cache write and commit.
        runner.apply_batch(&batch);
        runner.apply_batch(&batch);

        assert_eq!(runner.status.applied(), 1);
        let _ = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_event_is_skipped_not_fatal() {
        let runner = runner(Arc::new(InMemoryEventLog::new(1)), CancellationToken::new());

        let batch = vec![
            record(0, 1, "AAPL", b"{not valid".to_vec()),
            record(0, 2, "AAPL", tick_bytes("AAPL", "151.00")),
        ];
        let offsets = runner.apply_batch(&batch);

        // The poison pill is skipped but its offset still commits, so the
        // partition never stalls.
        assert_eq!(offsets.get(&0), Some(&3));
        assert_eq!(runner.status.skipped(), 1);
        assert_eq!(runner.status.applied(), 1);
    }

    #[tokio::test]
    async fn runner_consumes_published_events_end_to_end() {
        let log = Arc::new(InMemoryEventLog::new(3));
        let cancel = CancellationToken::new();
        let runner = runner(Arc::clone(&log), cancel.clone());
        let status = runner.status();
        let cache = Arc::clone(&runner.cache);
        let mut rx = runner.hub.subscribe(ChannelCategory::Ticks);

        let handle = tokio::spawn(runner.run());

        // Wait for the runner to join before producing.
        for _ in 0..100 {
            if status.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(status.is_ready());

        use crate::application::ports::event_log::{EventLogProducerPort, ProducerRecord};
        log.produce(
            Topic::MarketTicks,
            ProducerRecord {
                key: "AAPL".to_string(),
                payload: tick_bytes("AAPL", "178.50"),
            },
        )
        .await
        .unwrap();

        let note = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.key, InterestKey::Tick("AAPL".to_string()));
        assert!(cache.read(&note.key).is_some());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(status.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn runner_rejoins_after_rebalance() {
        let log = Arc::new(InMemoryEventLog::new(1));
        let cancel = CancellationToken::new();
        let runner = runner(Arc::clone(&log), cancel.clone());
        let status = runner.status();
        let mut rx = runner.hub.subscribe(ChannelCategory::Ticks);

        let handle = tokio::spawn(runner.run());
        for _ in 0..100 {
            if status.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        log.trigger_rebalance(Topic::MarketTicks.consumer_group(), Topic::MarketTicks);

        use crate::application::ports::event_log::{EventLogProducerPort, ProducerRecord};
        log.produce(
            Topic::MarketTicks,
            ProducerRecord {
                key: "AAPL".to_string(),
                payload: tick_bytes("AAPL", "180.00"),
            },
        )
        .await
        .unwrap();

        // The runner rejoins and keeps consuming.
        let note = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.marker, OffsetMarker::new(0));

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[test]
    fn consumer_state_readiness() {
        assert!(ConsumerState::Joined.is_ready());
        assert!(ConsumerState::Consuming.is_ready());
        assert!(!ConsumerState::Stopped.is_ready());
        assert!(!ConsumerState::Connecting.is_ready());
        assert!(!ConsumerState::Rebalancing.is_ready());
    }
}
