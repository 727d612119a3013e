//! Notify Hub
//!
//! Broadcast channels carrying cache-change notifications to the fan-out
//! server, one channel per key namespace category.
//!
//! Notifications are ephemeral: no persistence, no acknowledgment, no
//! delivery guarantee. Losing one is acceptable because the next cache
//! read still returns current state; callers must never depend on the
//! hub for correctness.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::domain::envelope::{EventPayload, OffsetMarker};
use crate::domain::interest::{ChannelCategory, InterestKey};
use crate::infrastructure::config::NotifySettings;

// =============================================================================
// Notification
// =============================================================================

/// One cache-change notification, carrying the same payload as the cache
/// write that triggered it.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Key the cache write landed on.
    pub key: InterestKey,
    /// The newly cached payload.
    pub payload: EventPayload,
    /// Offset marker of the applied event.
    pub marker: OffsetMarker,
    /// Production timestamp of the applied event.
    pub produced_at: DateTime<Utc>,
}

// =============================================================================
// Notify Hub
// =============================================================================

/// Central hub of per-category broadcast channels.
///
/// Receivers are attached per connection when the first key of a category
/// is subscribed and dropped when the last is removed.
#[derive(Debug)]
pub struct NotifyHub {
    ticks_tx: broadcast::Sender<Notification>,
    order_books_tx: broadcast::Sender<Notification>,
    orders_tx: broadcast::Sender<Notification>,
    risk_tx: broadcast::Sender<Notification>,
    alerts_tx: broadcast::Sender<Notification>,
}

impl NotifyHub {
    /// Create a hub with the configured channel capacities.
    #[must_use]
    pub fn new(settings: &NotifySettings) -> Self {
        Self {
            ticks_tx: broadcast::channel(settings.ticks_capacity).0,
            order_books_tx: broadcast::channel(settings.order_books_capacity).0,
            orders_tx: broadcast::channel(settings.orders_capacity).0,
            risk_tx: broadcast::channel(settings.risk_capacity).0,
            alerts_tx: broadcast::channel(settings.alerts_capacity).0,
        }
    }

    /// Create a hub with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&NotifySettings::default())
    }

    /// Broadcast a notification to current subscribers of its category.
    ///
    /// Fire-and-forget: returns the number of receivers reached, or
    /// `None` when nobody is listening.
    pub fn publish(&self, notification: Notification) -> Option<usize> {
        let category = notification.key.category();
        self.sender(category).send(notification).ok()
    }

    /// Attach a new receiver for `category`.
    #[must_use]
    pub fn subscribe(&self, category: ChannelCategory) -> broadcast::Receiver<Notification> {
        self.sender(category).subscribe()
    }

    /// Number of active receivers for `category`.
    #[must_use]
    pub fn receiver_count(&self, category: ChannelCategory) -> usize {
        self.sender(category).receiver_count()
    }

    /// Receiver counts across all categories.
    #[must_use]
    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            ticks_receivers: self.receiver_count(ChannelCategory::Ticks),
            order_books_receivers: self.receiver_count(ChannelCategory::OrderBooks),
            orders_receivers: self.receiver_count(ChannelCategory::Orders),
            risk_receivers: self.receiver_count(ChannelCategory::Risk),
            alerts_receivers: self.receiver_count(ChannelCategory::Alerts),
        }
    }

    const fn sender(&self, category: ChannelCategory) -> &broadcast::Sender<Notification> {
        match category {
            ChannelCategory::Ticks => &self.ticks_tx,
            ChannelCategory::OrderBooks => &self.order_books_tx,
            ChannelCategory::Orders => &self.orders_tx,
            ChannelCategory::Risk => &self.risk_tx,
            ChannelCategory::Alerts => &self.alerts_tx,
        }
    }
}

/// Receiver counts per category.
#[derive(Debug, Clone, Default)]
pub struct NotifyStats {
    /// Tick channel receivers.
    pub ticks_receivers: usize,
    /// Order book channel receivers.
    pub order_books_receivers: usize,
    /// Order event channel receivers.
    pub orders_receivers: usize,
    /// Risk channel receivers.
    pub risk_receivers: usize,
    /// Alert channel receivers.
    pub alerts_receivers: usize,
}

impl NotifyStats {
    /// Total receivers across all categories.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.ticks_receivers
            + self.order_books_receivers
            + self.orders_receivers
            + self.risk_receivers
            + self.alerts_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================
