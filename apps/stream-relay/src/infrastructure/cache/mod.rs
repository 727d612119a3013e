//! State Cache Bridge
//!
//! Latest-value cache keyed by entity, plus the notify hub that converts
//! every accepted write into a best-effort fan-out notification.
//!
//! The cache is the single point of synchronized truth per key. All
//! mutation goes through [`StateCache::write`], a per-key compare-and-set
//! on the offset marker, which eliminates lost-update races between
//! consumer redelivery and fresh writes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::envelope::{EventPayload, OffsetMarker};
use crate::domain::interest::InterestKey;

mod notify;

pub use notify::{Notification, NotifyHub, NotifyStats};

// =============================================================================
// Write Outcome
// =============================================================================

/// Result of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The entry was replaced: this marker was strictly newer.
    Applied,
    /// No-op: the stored marker was the same age or newer. Redelivered
    /// and reordered older events land here.
    Stale,
}

impl WriteOutcome {
    /// Whether the write changed the cached value.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

// =============================================================================
// Cached Value
// =============================================================================

/// A value read back from the cache.
#[derive(Debug, Clone)]
pub struct CachedValue {
    /// The latest payload for the key.
    pub payload: EventPayload,
    /// Offset marker of the event that produced it.
    pub marker: OffsetMarker,
    /// Production timestamp of that event.
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: EventPayload,
    marker: OffsetMarker,
    produced_at: DateTime<Utc>,
    written_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) >= self.ttl
    }
}

// =============================================================================
// State Cache
// =============================================================================

/// Latest-known-value cache with TTL-based staleness.
///
/// Reads are cache-aside: a miss returns absent and never blocks on
/// upstream recomputation.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: RwLock<HashMap<InterestKey, CacheEntry>>,
}

impl StateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare-and-set write.
    ///
    /// Replaces the entry only when `marker` is strictly newer than the
    /// stored marker. The comparison is made against whatever is stored
    /// for the key regardless of TTL expiry: a race between expiry and a
    /// concurrent write resolves in favor of whichever event holds the
    /// newer marker, never wall-clock bookkeeping.
    pub fn write(
        &self,
        key: InterestKey,
        payload: EventPayload,
        marker: OffsetMarker,
        ttl: Duration,
        produced_at: DateTime<Utc>,
    ) -> WriteOutcome {
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&key) {
            if !marker.is_newer_than(existing.marker) {
                return WriteOutcome::Stale;
            }
        }

        entries.insert(
            key,
            CacheEntry {
                payload,
                marker,
                produced_at,
                written_at: Instant::now(),
                ttl,
            },
        );

        WriteOutcome::Applied
    }

    /// Read the current value, or `None` when missing or expired.
    #[must_use]
    pub fn read(&self, key: &InterestKey) -> Option<CachedValue> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;

        if entry.is_expired(Instant::now()) {
            return None;
        }

        Some(CachedValue {
            payload: entry.payload.clone(),
            marker: entry.marker,
            produced_at: entry.produced_at,
        })
    }

    /// Number of entries, including expired ones not yet overwritten.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
