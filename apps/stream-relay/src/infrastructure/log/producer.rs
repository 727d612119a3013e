//! Producer Gateway
//!
//! Publishes domain events onto the event log with delivery guarantees
//! strong enough that downstream consumers only need "replace with newer
//! offset" deduplication: non-empty partition keys for per-entity
//! ordering, acks from all in-sync replicas before success, and bounded
//! retries with exponential backoff for transient broker failures.
//!
//! A publish failure is always surfaced to the caller; callers such as
//! order-state transitions depend on durability before deciding anything
//! further.

use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::event_log::{
    EventLogProducerPort, LogError, ProducerRecord, RecordMeta,
};
use crate::domain::envelope::{EventPayload, Topic};
use crate::infrastructure::log::retry::RetryPolicy;
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Publish failure surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Partition key was empty; affinity would be lost.
    #[error("publish key must not be empty")]
    EmptyKey,

    /// Payload does not belong on the target topic.
    #[error("payload variant {variant} does not belong on topic {topic}")]
    WrongTopic {
        /// Target topic.
        topic: Topic,
        /// The payload's wire tag.
        variant: &'static str,
    },

    /// Payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A batch item failed validation; the whole batch was rejected
    /// before any network call.
    #[error("batch item {index} invalid: {reason}")]
    InvalidBatchItem {
        /// Index of the offending item.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The log rejected the request; retrying would not help.
    #[error("publish rejected: {0}")]
    Rejected(#[source] LogError),

    /// Transient failures persisted past the attempt cap.
    #[error("delivery failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// The final transient failure.
        #[source]
        source: LogError,
    },
}

// =============================================================================
// Gateway
// =============================================================================

/// Reliability wrapper around the producer side of the event log.
pub struct ProducerGateway {
    log: Arc<dyn EventLogProducerPort>,
    retry: RetryPolicy,
    publish_timeout: Duration,
}

impl ProducerGateway {
    /// Create a gateway over `log`.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLogProducerPort>,
        retry: RetryPolicy,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            log,
            retry,
            publish_timeout,
        }
    }

    /// Publish one event, returning its committed placement.
    ///
    /// The key must be non-empty: it drives partition affinity so all
    /// events for the same entity stay ordered.
    pub async fn publish(
        &self,
        topic: Topic,
        key: &str,
        payload: &EventPayload,
    ) -> Result<RecordMeta, DeliveryError> {
        let record = Self::validate(topic, key, payload).map_err(|reason| reason.into_error(0))?;

        let metas = self
            .send_with_retry(topic, vec![record], |log, topic, mut records| async move {
                // Single-record publish rides the same path as batches.
                let record = records.remove(0);
                log.produce(topic, record).await.map(|meta| vec![meta])
            })
            .await?;

        Ok(metas[0])
    }

    /// Publish a batch of `(key, payload)` items with the same guarantees,
    /// amortized over one round trip.
    ///
    /// Validation is all-or-nothing: any invalid item rejects the whole
    /// batch before anything is sent, so there are no partial silent drops.
    pub async fn publish_batch(
        &self,
        topic: Topic,
        items: &[(String, EventPayload)],
    ) -> Result<Vec<RecordMeta>, DeliveryError> {
        let mut records = Vec::with_capacity(items.len());
        for (index, (key, payload)) in items.iter().enumerate() {
            let record =
                Self::validate(topic, key, payload).map_err(|reason| reason.into_error(index))?;
            records.push(record);
        }

        if records.is_empty() {
            return Ok(Vec::new());
        }

        self.send_with_retry(topic, records, |log, topic, records| async move {
            log.produce_batch(topic, records).await
        })
        .await
    }

    fn validate(
        topic: Topic,
        key: &str,
        payload: &EventPayload,
    ) -> Result<ProducerRecord, InvalidItem> {
        if key.is_empty() {
            return Err(InvalidItem::EmptyKey);
        }
        if payload.topic() != topic {
            return Err(InvalidItem::WrongTopic {
                topic,
                variant: payload.variant_name(),
            });
        }
        let bytes = payload.encode().map_err(InvalidItem::Serialization)?;
        Ok(ProducerRecord {
            key: key.to_string(),
            payload: bytes,
        })
    }

    async fn send_with_retry<F, Fut>(
        &self,
        topic: Topic,
        records: Vec<ProducerRecord>,
        send: F,
    ) -> Result<Vec<RecordMeta>, DeliveryError>
    where
        F: Fn(Arc<dyn EventLogProducerPort>, Topic, Vec<ProducerRecord>) -> Fut,
        Fut: Future<Output = Result<Vec<RecordMeta>, LogError>>,
    {
        let mut backoff = self.retry.backoff();

        loop {
            let attempt_result = tokio::time::timeout(
                self.publish_timeout,
                send(Arc::clone(&self.log), topic, records.clone()),
            )
            .await
            .map_or(Err(LogError::Timeout), |result| result);

            match attempt_result {
                Ok(metas) => return Ok(metas),
                Err(error) if error.is_transient() || matches!(error, LogError::Rebalanced) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(DeliveryError::Exhausted {
                            attempts: backoff.attempt(),
                            source: error,
                        });
                    };

                    metrics::record_publish_retry(topic);
                    tracing::warn!(
                        topic = %topic,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Publish attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(DeliveryError::Rejected(error)),
            }
        }
    }
}

enum InvalidItem {
    EmptyKey,
    WrongTopic {
        topic: Topic,
        variant: &'static str,
    },
    Serialization(serde_json::Error),
}

impl InvalidItem {
    fn into_error(self, index: usize) -> DeliveryError {
        match (self, index) {
            (Self::EmptyKey, 0) => DeliveryError::EmptyKey,
            (Self::WrongTopic { topic, variant }, 0) => DeliveryError::WrongTopic { topic, variant },
            (Self::Serialization(e), 0) => DeliveryError::Serialization(e),
            (Self::EmptyKey, index) => DeliveryError::InvalidBatchItem {
                index,
                reason: "empty key".to_string(),
            },
            (Self::WrongTopic { topic, variant }, index) => DeliveryError::InvalidBatchItem {
                index,
                reason: format!("payload {variant} does not belong on topic {topic}"),
            },
            (Self::Serialization(e), index) => DeliveryError::InvalidBatchItem {
                index,
                reason: e.to_string(),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::event_log::MockEventLogProducerPort;
    use crate::domain::envelope::{MarketTick, RiskEvent, SCHEMA_VERSION};
    use crate::infrastructure::log::memory::InMemoryEventLog;

    fn tick(symbol: &str, price: &str) -> EventPayload {
        EventPayload::MarketTick(MarketTick {
            schema_version: SCHEMA_VERSION,
            symbol: symbol.to_string(),
            price: Decimal::from_str(price).unwrap(),
            volume: 0,
            bid: None,
            ask: None,
        })
    }

    fn risk(portfolio: &str) -> EventPayload {
        EventPayload::RiskEvent(RiskEvent {
            schema_version: SCHEMA_VERSION,
            portfolio_id: portfolio.to_string(),
            var_95: Decimal::ONE,
            var_99: Decimal::TWO,
            exposure: Decimal::ZERO,
            beta: Decimal::ONE,
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn gateway(log: Arc<dyn EventLogProducerPort>) -> ProducerGateway {
        ProducerGateway::new(log, fast_policy(3), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn publish_returns_committed_placement() {
        let log = Arc::new(InMemoryEventLog::new(3));
        let gateway = gateway(log);

        let meta = gateway
            .publish(Topic::MarketTicks, "AAPL", &tick("AAPL", "178.50"))
            .await
            .unwrap();
        assert_eq!(meta.offset, 0);

        let meta = gateway
            .publish(Topic::MarketTicks, "AAPL", &tick("AAPL", "179.00"))
            .await
            .unwrap();
        assert_eq!(meta.offset, 1);
    }

    #[tokio::test]
    async fn publish_requires_non_empty_key() {
        let log = Arc::new(InMemoryEventLog::new(1));
        let gateway = gateway(log);

        let err = gateway
            .publish(Topic::MarketTicks, "", &tick("AAPL", "1.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::EmptyKey));
    }

    #[tokio::test]
    async fn publish_rejects_payload_on_wrong_topic() {
        let log = Arc::new(InMemoryEventLog::new(1));
        let gateway = gateway(log);

        let err = gateway
            .publish(Topic::MarketTicks, "P1", &risk("P1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::WrongTopic { .. }));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let mut mock = MockEventLogProducerPort::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let call_count = Arc::clone(&attempts);
        mock.expect_produce().times(3).returning(move |_, _| {
            if call_count.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LogError::Unavailable("broker down".to_string()))
            } else {
                Ok(RecordMeta {
                    partition: 0,
                    offset: 7,
                })
            }
        });

        let gateway = gateway(Arc::new(mock));
        let meta = gateway
            .publish(Topic::MarketTicks, "AAPL", &tick("AAPL", "1.00"))
            .await
            .unwrap();
        assert_eq!(meta.offset, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_delivery_failure() {
        let mut mock = MockEventLogProducerPort::new();
        mock.expect_produce()
            .returning(|_, _| Err(LogError::Unavailable("broker down".to_string())));

        let gateway = gateway(Arc::new(mock));
        let err = gateway
            .publish(Topic::MarketTicks, "AAPL", &tick("AAPL", "1.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let mut mock = MockEventLogProducerPort::new();
        mock.expect_produce()
            .times(1)
            .returning(|_, _| Err(LogError::Rejected("record too large".to_string())));

        let gateway = gateway(Arc::new(mock));
        let err = gateway
            .publish(Topic::MarketTicks, "AAPL", &tick("AAPL", "1.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
    }

    #[tokio::test]
    async fn batch_with_invalid_item_is_rejected_before_any_send() {
        let mut mock = MockEventLogProducerPort::new();
        // The port must never be reached.
        mock.expect_produce_batch().times(0);

        let gateway = gateway(Arc::new(mock));
        let items = vec![
            ("AAPL".to_string(), tick("AAPL", "1.00")),
            (String::new(), tick("MSFT", "2.00")),
        ];

        let err = gateway
            .publish_batch(Topic::MarketTicks, &items)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::InvalidBatchItem { index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn batch_publish_preserves_item_order() {
        let log = Arc::new(InMemoryEventLog::new(1));
        let gateway = gateway(log);

        let items = vec![
            ("AAPL".to_string(), tick("AAPL", "1.00")),
            ("AAPL".to_string(), tick("AAPL", "2.00")),
            ("AAPL".to_string(), tick("AAPL", "3.00")),
        ];
        let metas = gateway
            .publish_batch(Topic::MarketTicks, &items)
            .await
            .unwrap();

        assert_eq!(metas.len(), 3);
        assert!(metas[0].offset < metas[1].offset);
        assert!(metas[1].offset < metas[2].offset);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let mut mock = MockEventLogProducerPort::new();
        mock.expect_produce_batch().times(0);

        let gateway = gateway(Arc::new(mock));
        let metas = gateway
            .publish_batch(Topic::MarketTicks, &[])
            .await
            .unwrap();
        assert!(metas.is_empty());
    }
}
