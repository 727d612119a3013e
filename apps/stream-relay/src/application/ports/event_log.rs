//! Event Log Ports (Driven Ports)
//!
//! Contracts for the durable, partitioned event log. The log itself is an
//! external collaborator; the relay only depends on these interfaces. The
//! bundled in-memory adapter lives in `infrastructure::log::memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::envelope::Topic;

// =============================================================================
// Errors
// =============================================================================

/// Event log operation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogError {
    /// Broker unreachable or not ready; safe to retry with backoff.
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    /// The log rejected the request; retrying the same request will not help.
    #[error("event log rejected request: {0}")]
    Rejected(String),

    /// The group coordinator revoked this member's partitions; the caller
    /// must finish committed work and rejoin.
    #[error("partition assignment revoked, rejoin required")]
    Rebalanced,

    /// The operation timed out. Treated as a failure, never as an
    /// implicit retry-forever.
    #[error("event log operation timed out")]
    Timeout,
}

impl LogError {
    /// Whether the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A record handed to the producer side of the log.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    /// Partition affinity key. Must be non-empty.
    pub key: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
}

/// Placement metadata returned once a record is durable on all in-sync
/// replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    /// Partition the record landed on.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
}

/// A record fetched from the consumer side of the log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Partition the record came from.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Partition affinity key.
    pub key: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Production timestamp.
    pub produced_at: DateTime<Utc>,
}

/// Partitions owned by a group member after joining.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Topic the member consumes.
    pub topic: Topic,
    /// Partitions owned exclusively until the next rebalance.
    pub partitions: Vec<u32>,
}

/// Offsets to commit per partition: the next offset to read, i.e. one past
/// the last fully applied record. Commits must be monotonic; a member
/// never commits past an unprocessed offset.
pub type CommittedOffsets = HashMap<u32, u64>;

// =============================================================================
// Ports
// =============================================================================

/// Producer side of the event log.
///
/// Implementations must wait for all in-sync replicas before returning
/// success and must be idempotent under retry, so duplicate publish
/// attempts after a transient failure do not duplicate logical effects.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLogProducerPort: Send + Sync {
    /// Append one record to `topic`.
    async fn produce(&self, topic: Topic, record: ProducerRecord) -> Result<RecordMeta, LogError>;

    /// Append a batch of records to `topic`, amortizing the round trip.
    async fn produce_batch(
        &self,
        topic: Topic,
        records: Vec<ProducerRecord>,
    ) -> Result<Vec<RecordMeta>, LogError>;
}

/// Consumer side of the event log, scoped to consumer groups.
///
/// `poll` and `commit` fail with [`LogError::Rebalanced`] once the
/// coordinator has revoked the member's partitions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLogConsumerPort: Send + Sync {
    /// Join `group` for `topic`. New groups start at the latest offsets.
    async fn join(&self, group: &str, topic: Topic) -> Result<Assignment, LogError>;

    /// Fetch up to `max_records` ordered records from owned partitions,
    /// advancing the fetch position past what is returned.
    async fn poll(
        &self,
        group: &str,
        topic: Topic,
        max_records: usize,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Durably record consumption progress for owned partitions.
    async fn commit(
        &self,
        group: &str,
        topic: Topic,
        offsets: &CommittedOffsets,
    ) -> Result<(), LogError>;

    /// Leave the group, relinquishing owned partitions.
    async fn leave(&self, group: &str, topic: Topic) -> Result<(), LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(LogError::Unavailable("broker down".to_string()).is_transient());
        assert!(LogError::Timeout.is_transient());
        assert!(!LogError::Rejected("bad record".to_string()).is_transient());
        assert!(!LogError::Rebalanced.is_transient());
    }
}
