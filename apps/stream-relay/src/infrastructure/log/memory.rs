//! In-Memory Event Log Adapter
//!
//! Implements both event log ports against process-local state:
//! partitioned topics with key-hash affinity, per-partition append
//! offsets, and per-group commit/fetch positions. New groups start at the
//! latest offsets, matching the relay's "from latest" consumption policy.
//!
//! Used by tests and local development; a production deployment
//! substitutes a real broker adapter behind the same ports.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::application::ports::event_log::{
    Assignment, CommittedOffsets, EventLogConsumerPort, EventLogProducerPort, LogError, LogRecord,
    ProducerRecord, RecordMeta,
};
use crate::domain::envelope::Topic;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    produced_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GroupState {
    joined: bool,
    rebalance_pending: bool,
    /// Next offset to read per partition, as durably committed.
    committed: HashMap<u32, u64>,
    /// Fetch position per partition; runs ahead of `committed` while a
    /// batch is in flight and rewinds to it on rejoin.
    position: HashMap<u32, u64>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<Topic, Vec<Vec<StoredRecord>>>,
    groups: HashMap<(String, Topic), GroupState>,
}

impl State {
    fn partitions_mut(&mut self, topic: Topic, partition_count: u32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic)
            .or_insert_with(|| vec![Vec::new(); partition_count as usize])
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Process-local event log implementing both log ports.
#[derive(Debug)]
pub struct InMemoryEventLog {
    partition_count: u32,
    unavailable: AtomicBool,
    inner: Mutex<State>,
}

impl InMemoryEventLog {
    /// Create a log with `partition_count` partitions per topic.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
            unavailable: AtomicBool::new(false),
            inner: Mutex::new(State::default()),
        }
    }

    /// Simulate broker unavailability. While set, every operation fails
    /// with [`LogError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force a rebalance for `group`: its next poll or commit fails with
    /// [`LogError::Rebalanced`] and the member must rejoin.
    pub fn trigger_rebalance(&self, group: &str, topic: Topic) {
        let mut state = self.inner.lock();
        if let Some(group_state) = state.groups.get_mut(&(group.to_string(), topic)) {
            group_state.rebalance_pending = true;
        }
    }

    /// Current end offset per partition of `topic`.
    #[must_use]
    pub fn end_offsets(&self, topic: Topic) -> HashMap<u32, u64> {
        let mut state = self.inner.lock();
        let partition_count = self.partition_count;
        state
            .partitions_mut(topic, partition_count)
            .iter()
            .enumerate()
            .map(|(partition, records)| (partition as u32, records.len() as u64))
            .collect()
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partition_count)) as u32
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("in-memory log marked down".to_string()));
        }
        Ok(())
    }

    fn append(&self, state: &mut State, topic: Topic, record: ProducerRecord) -> RecordMeta {
        let partition = self.partition_for(&record.key);
        let partitions = state.partitions_mut(topic, self.partition_count);
        let log = &mut partitions[partition as usize];
        let offset = log.len() as u64;
        log.push(StoredRecord {
            key: record.key,
            payload: record.payload,
            produced_at: Utc::now(),
        });
        RecordMeta { partition, offset }
    }
}

#[async_trait]
impl EventLogProducerPort for InMemoryEventLog {
    async fn produce(&self, topic: Topic, record: ProducerRecord) -> Result<RecordMeta, LogError> {
        self.check_available()?;
        if record.key.is_empty() {
            return Err(LogError::Rejected("empty partition key".to_string()));
        }

        let mut state = self.inner.lock();
        Ok(self.append(&mut state, topic, record))
    }

    async fn produce_batch(
        &self,
        topic: Topic,
        records: Vec<ProducerRecord>,
    ) -> Result<Vec<RecordMeta>, LogError> {
        self.check_available()?;
        if records.iter().any(|r| r.key.is_empty()) {
            return Err(LogError::Rejected("empty partition key".to_string()));
        }

        let mut state = self.inner.lock();
        Ok(records
            .into_iter()
            .map(|record| self.append(&mut state, topic, record))
            .collect())
    }
}

#[async_trait]
impl EventLogConsumerPort for InMemoryEventLog {
    async fn join(&self, group: &str, topic: Topic) -> Result<Assignment, LogError> {
        self.check_available()?;

        let mut state = self.inner.lock();
        let partition_count = self.partition_count;
        let end_offsets: HashMap<u32, u64> = state
            .partitions_mut(topic, partition_count)
            .iter()
            .enumerate()
            .map(|(partition, records)| (partition as u32, records.len() as u64))
            .collect();

        let group_state = state
            .groups
            .entry((group.to_string(), topic))
            .or_insert_with(|| GroupState {
                // New groups consume from the latest offsets only.
                committed: end_offsets.clone(),
                ..GroupState::default()
            });

        group_state.joined = true;
        group_state.rebalance_pending = false;
        // Rewind the fetch position to committed progress so anything
        // uncommitted before the rejoin is redelivered.
        group_state.position = group_state.committed.clone();

        Ok(Assignment {
            topic,
            partitions: (0..partition_count).collect(),
        })
    }

    async fn poll(
        &self,
        group: &str,
        topic: Topic,
        max_records: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        self.check_available()?;

        let mut state = self.inner.lock();
        let group_key = (group.to_string(), topic);

        {
            let group_state = state
                .groups
                .get_mut(&group_key)
                .filter(|g| g.joined)
                .ok_or_else(|| LogError::Rejected(format!("group {group} has not joined")))?;

            if group_state.rebalance_pending {
                group_state.joined = false;
                return Err(LogError::Rebalanced);
            }
        }

        let partition_count = self.partition_count;
        let mut fetched = Vec::new();
        for partition in 0..partition_count {
            let start = state
                .groups
                .get(&group_key)
                .and_then(|g| g.position.get(&partition).copied())
                .unwrap_or(0);

            let available: Vec<(u64, StoredRecord)> = {
                let partitions = state.partitions_mut(topic, partition_count);
                partitions[partition as usize]
                    .iter()
                    .enumerate()
                    .skip(start as usize)
                    .take(max_records.saturating_sub(fetched.len()))
                    .map(|(offset, record)| (offset as u64, record.clone()))
                    .collect()
            };

            if let Some((last_offset, _)) = available.last() {
                if let Some(group_state) = state.groups.get_mut(&group_key) {
                    group_state.position.insert(partition, last_offset + 1);
                }
            }

            fetched.extend(available.into_iter().map(|(offset, record)| LogRecord {
                partition,
                offset,
                key: record.key,
                payload: record.payload,
                produced_at: record.produced_at,
            }));

            if fetched.len() >= max_records {
                break;
            }
        }

        Ok(fetched)
    }

    async fn commit(
        &self,
        group: &str,
        topic: Topic,
        offsets: &CommittedOffsets,
    ) -> Result<(), LogError> {
        self.check_available()?;

        let mut state = self.inner.lock();
        let group_state = state
            .groups
            .get_mut(&(group.to_string(), topic))
            .filter(|g| g.joined)
            .ok_or_else(|| LogError::Rejected(format!("group {group} has not joined")))?;

        if group_state.rebalance_pending {
            group_state.joined = false;
            return Err(LogError::Rebalanced);
        }

        for (&partition, &offset) in offsets {
            // Commits are monotonic; a stale commit never rewinds progress.
            let entry = group_state.committed.entry(partition).or_insert(0);
            *entry = (*entry).max(offset);
        }

        Ok(())
    }

    async fn leave(&self, group: &str, topic: Topic) -> Result<(), LogError> {
        let mut state = self.inner.lock();
        if let Some(group_state) = state.groups.get_mut(&(group.to_string(), topic)) {
            group_state.joined = false;
            group_state.position = group_state.committed.clone();
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, payload: &str) -> ProducerRecord {
        ProducerRecord {
            key: key.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let log = InMemoryEventLog::new(3);

        let first = log
            .produce(Topic::MarketTicks, record("AAPL", "a"))
            .await
            .unwrap();
        let second = log
            .produce(Topic::MarketTicks, record("AAPL", "b"))
            .await
            .unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let log = InMemoryEventLog::new(3);
        let err = log
            .produce(Topic::MarketTicks, record("", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Rejected(_)));
    }

    #[tokio::test]
    async fn new_group_starts_at_latest() {
        let log = InMemoryEventLog::new(1);

        // Produced before the group exists: never delivered.
        log.produce(Topic::MarketTicks, record("AAPL", "old"))
            .await
            .unwrap();

        log.join("g", Topic::MarketTicks).await.unwrap();
        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert!(batch.is_empty());

        log.produce(Topic::MarketTicks, record("AAPL", "new"))
            .await
            .unwrap();
        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"new");
    }

    #[tokio::test]
    async fn poll_without_join_is_rejected() {
        let log = InMemoryEventLog::new(1);
        let err = log.poll("g", Topic::MarketTicks, 10).await.unwrap_err();
        assert!(matches!(err, LogError::Rejected(_)));
    }

    #[tokio::test]
    async fn uncommitted_records_redeliver_after_rejoin() {
        let log = InMemoryEventLog::new(1);
        log.join("g", Topic::MarketTicks).await.unwrap();

        log.produce(Topic::MarketTicks, record("AAPL", "a"))
            .await
            .unwrap();

        // Fetched but never committed: a crash before commit.
        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert_eq!(batch.len(), 1);

        log.join("g", Topic::MarketTicks).await.unwrap();
        let redelivered = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].offset, batch[0].offset);
    }

    #[tokio::test]
    async fn committed_records_are_not_redelivered() {
        let log = InMemoryEventLog::new(1);
        log.join("g", Topic::MarketTicks).await.unwrap();

        log.produce(Topic::MarketTicks, record("AAPL", "a"))
            .await
            .unwrap();

        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        let mut offsets = CommittedOffsets::new();
        offsets.insert(batch[0].partition, batch[0].offset + 1);
        log.commit("g", Topic::MarketTicks, &offsets).await.unwrap();

        log.join("g", Topic::MarketTicks).await.unwrap();
        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn stale_commit_never_rewinds_progress() {
        let log = InMemoryEventLog::new(1);
        log.join("g", Topic::MarketTicks).await.unwrap();

        for i in 0..3 {
            log.produce(Topic::MarketTicks, record("AAPL", &i.to_string()))
                .await
                .unwrap();
        }
        let batch = log.poll("g", Topic::MarketTicks, 10).await.unwrap();
        assert_eq!(batch.len(), 3);

        let mut offsets = CommittedOffsets::new();
        offsets.insert(0, 3);
        log.commit("g", Topic::MarketTicks, &offsets).await.unwrap();

        // An older commit arriving late is ignored.
        offsets.insert(0, 1);
        log.commit("g", Topic::MarketTicks, &offsets).await.unwrap();

        log.join("g", Topic::MarketTicks).await.unwrap();
        assert!(log.poll("g", Topic::MarketTicks, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebalance_fails_poll_until_rejoin() {
        let log = InMemoryEventLog::new(1);
        log.join("g", Topic::MarketTicks).await.unwrap();

        log.trigger_rebalance("g", Topic::MarketTicks);
        let err = log.poll("g", Topic::MarketTicks, 10).await.unwrap_err();
        assert!(matches!(err, LogError::Rebalanced));

        // Rejoin restores consumption.
        log.join("g", Topic::MarketTicks).await.unwrap();
        assert!(log.poll("g", Topic::MarketTicks, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_log_fails_every_operation() {
        let log = InMemoryEventLog::new(1);
        log.set_unavailable(true);

        let err = log
            .produce(Topic::MarketTicks, record("AAPL", "a"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = log.join("g", Topic::MarketTicks).await.unwrap_err();
        assert!(err.is_transient());

        log.set_unavailable(false);
        log.join("g", Topic::MarketTicks).await.unwrap();
    }
}
