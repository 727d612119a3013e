//! Per-Connection Outbound Buffer
//!
//! Bounded buffer between notification fan-out and the socket writer,
//! with a deliberate lossy-under-load policy: capacity is bounded per
//! subscribed key, and when a key's quota is full the oldest buffered
//! frame for that key is dropped in favor of the newest. A live feed
//! cares about the current value, not history; this is a documented
//! policy, not a bug. Dropped frames are counted and metered.
//!
//! Control frames (subscribe rejections) are queued separately and are
//! never dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A frame queued for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    /// Wire key the frame belongs to; empty for control frames.
    pub key: String,
    /// Serialized frame text.
    pub text: String,
}

#[derive(Debug, Default)]
struct BufferState {
    /// Data frames in arrival order across keys.
    data: VecDeque<QueuedFrame>,
    /// Buffered frame count per key.
    per_key: HashMap<String, usize>,
    /// Control frames, drained before data.
    control: VecDeque<String>,
}

/// Bounded per-key outbound buffer with drop-oldest overflow.
#[derive(Debug)]
pub struct OutboundBuffer {
    state: Mutex<BufferState>,
    capacity_per_key: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl OutboundBuffer {
    /// Create a buffer allowing `capacity_per_key` frames per key.
    #[must_use]
    pub fn new(capacity_per_key: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity_per_key: capacity_per_key.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Queue a data frame for `key`, dropping that key's oldest frame
    /// when the key's quota is full.
    ///
    /// Returns `true` when an older frame was evicted to make room.
    pub fn push(&self, key: &str, text: String) -> bool {
        let mut state = self.state.lock();

        let at_capacity =
            state.per_key.get(key).copied().unwrap_or(0) >= self.capacity_per_key;
        let mut evicted = false;
        if at_capacity {
            // Evict the oldest frame for this key only; other keys keep
            // their backlog.
            if let Some(position) = state.data.iter().position(|frame| frame.key == key) {
                state.data.remove(position);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                evicted = true;
            }
        } else {
            *state.per_key.entry(key.to_string()).or_insert(0) += 1;
        }

        state.data.push_back(QueuedFrame {
            key: key.to_string(),
            text,
        });
        drop(state);
        self.notify.notify_one();
        evicted
    }

    /// Queue a control frame. Never dropped.
    pub fn push_control(&self, text: String) {
        self.state.lock().control.push_back(text);
        self.notify.notify_one();
    }

    /// Take the next frame, preferring control frames, or `None` when
    /// empty.
    #[must_use]
    pub fn pop(&self) -> Option<QueuedFrame> {
        let mut state = self.state.lock();

        if let Some(text) = state.control.pop_front() {
            return Some(QueuedFrame {
                key: String::new(),
                text,
            });
        }

        let frame = state.data.pop_front()?;
        if let Some(count) = state.per_key.get_mut(&frame.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_key.remove(&frame.key);
            }
        }
        Some(frame)
    }

    /// Wait for the next frame.
    pub async fn next(&self) -> QueuedFrame {
        loop {
            if let Some(frame) = self.pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.data.len() + state.control.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames dropped by the overflow policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
