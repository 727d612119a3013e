//! Event Envelope Types
//!
//! Domain types for events flowing through the distribution pipeline:
//! log topics, per-partition offset markers, and the tagged payload
//! variants carried by each topic.
//!
//! # Schema evolution
//!
//! Every payload carries a `schema_version` field that defaults to the
//! current version when absent. Unknown JSON fields are ignored during
//! decoding (never fatal) so producers and consumers can roll forward
//! independently.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Topics
// =============================================================================

/// Logical channels on the event log.
///
/// Each topic is partitioned and ordered only within a partition. Every
/// topic has its own consumer group identity so topics can be scaled and
/// restarted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Real-time market data: ticks and order book deltas.
    MarketTicks,
    /// Order lifecycle events.
    OrderEvents,
    /// Risk recomputation results.
    RiskEvents,
    /// Alert triggers.
    Alerts,
}

impl Topic {
    /// All topics, in consumption order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::MarketTicks,
            Self::OrderEvents,
            Self::RiskEvents,
            Self::Alerts,
        ]
    }

    /// Wire name of the topic on the event log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketTicks => "market-ticks",
            Self::OrderEvents => "order-events",
            Self::RiskEvents => "risk-events",
            Self::Alerts => "alerts",
        }
    }

    /// Consumer group identity used when draining this topic.
    #[must_use]
    pub const fn consumer_group(self) -> &'static str {
        match self {
            Self::MarketTicks => "market-tick-consumer-group",
            Self::OrderEvents => "order-event-consumer-group",
            Self::RiskEvents => "risk-event-consumer-group",
            Self::Alerts => "alert-consumer-group",
        }
    }

    /// Parse a wire name back into a topic.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "market-ticks" => Some(Self::MarketTicks),
            "order-events" => Some(Self::OrderEvents),
            "risk-events" => Some(Self::RiskEvents),
            "alerts" => Some(Self::Alerts),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Offset Marker
// =============================================================================

/// Monotonically increasing per-partition sequence number.
///
/// Because producers key partition affinity by entity, markers are totally
/// ordered per entity key. The state cache uses this ordering (never
/// wall-clock arrival time) to deduplicate redelivered events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OffsetMarker(u64);

impl OffsetMarker {
    /// Create a marker from a raw partition offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw offset value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this marker is strictly newer than `other`.
    #[must_use]
    pub const fn is_newer_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

// =============================================================================
// Payload Bodies
// =============================================================================

/// Current payload schema version stamped on newly produced events.
pub const SCHEMA_VERSION: u32 = 1;

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop order.
    Stop,
    /// Stop-limit order.
    StopLimit,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, not yet working.
    Pending,
    /// Working on the book.
    Open,
    /// Partially filled.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled by the owner.
    Cancelled,
    /// Rejected by the venue.
    Rejected,
    /// Expired unfilled.
    Expired,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

/// A single price level in an order book delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Aggregate size at the level.
    pub size: Decimal,
}

/// Latest trade price for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTick {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Instrument symbol.
    pub symbol: String,
    /// Last trade price.
    pub price: Decimal,
    /// Trade volume.
    #[serde(default)]
    pub volume: u64,
    /// Best bid, when known.
    #[serde(default)]
    pub bid: Option<Decimal>,
    /// Best ask, when known.
    #[serde(default)]
    pub ask: Option<Decimal>,
}

/// Top-of-book depth update for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDelta {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Instrument symbol.
    pub symbol: String,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
    /// Book sequence number from the venue.
    #[serde(default)]
    pub sequence: u64,
}

/// Order lifecycle event scoped to a portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Order identifier.
    pub order_id: String,
    /// Owning portfolio.
    pub portfolio_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Limit/stop price, when applicable.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Current lifecycle status.
    pub status: OrderStatus,
}

/// Risk recomputation result for a portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskEvent {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Portfolio the metrics belong to.
    pub portfolio_id: String,
    /// Value-at-risk at 95% confidence.
    pub var_95: Decimal,
    /// Value-at-risk at 99% confidence.
    pub var_99: Decimal,
    /// Gross exposure.
    pub exposure: Decimal,
    /// Portfolio beta.
    pub beta: Decimal,
}

/// Alert trigger scoped to a portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Alert identifier.
    pub alert_id: String,
    /// Portfolio the alert concerns.
    pub portfolio_id: String,
    /// Severity level.
    pub severity: AlertSeverity,
    /// Short title.
    pub title: String,
    /// Human-readable detail.
    pub message: String,
}

// =============================================================================
// Event Payload
// =============================================================================

/// Tagged payload variant carried by an event envelope.
///
/// The `type` tag on the wire selects the variant; each log topic accepts
/// a fixed subset of variants (see [`EventPayload::topic`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Latest trade for a symbol.
    MarketTick(MarketTick),
    /// Depth update for a symbol.
    OrderBookDelta(OrderBookDelta),
    /// Order lifecycle event.
    OrderEvent(OrderEvent),
    /// Risk metrics for a portfolio.
    RiskEvent(RiskEvent),
    /// Alert trigger.
    Alert(Alert),
}

impl EventPayload {
    /// Decode a payload from raw record bytes using the topic's schema.
    ///
    /// Malformed bytes and payload variants that do not belong on `topic`
    /// both fail with a [`DecodeError`] scoped to the single event.
    pub fn decode(topic: Topic, bytes: &[u8]) -> Result<Self, DecodeError> {
        let payload: Self =
            serde_json::from_slice(bytes).map_err(|error| DecodeError::Malformed {
                topic,
                reason: error.to_string(),
            })?;

        if payload.topic() == topic {
            Ok(payload)
        } else {
            Err(DecodeError::TopicMismatch {
                topic,
                variant: payload.variant_name(),
            })
        }
    }

    /// Serialize the payload for production onto the log.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The topic this payload variant belongs on.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::MarketTick(_) | Self::OrderBookDelta(_) => Topic::MarketTicks,
            Self::OrderEvent(_) => Topic::OrderEvents,
            Self::RiskEvent(_) => Topic::RiskEvents,
            Self::Alert(_) => Topic::Alerts,
        }
    }

    /// Wire tag of the variant.
    #[must_use]
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::MarketTick(_) => "market_tick",
            Self::OrderBookDelta(_) => "order_book_delta",
            Self::OrderEvent(_) => "order_event",
            Self::RiskEvent(_) => "risk_event",
            Self::Alert(_) => "alert",
        }
    }

    /// Partition key for this payload.
    ///
    /// All events for the same entity share a key so they land on the same
    /// partition and stay ordered relative to each other.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        match self {
            Self::MarketTick(tick) => &tick.symbol,
            Self::OrderBookDelta(delta) => &delta.symbol,
            Self::OrderEvent(event) => &event.portfolio_id,
            Self::RiskEvent(event) => &event.portfolio_id,
            Self::Alert(alert) => &alert.portfolio_id,
        }
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// A decoded event as consumed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Topic the event was consumed from.
    pub topic: Topic,
    /// Partition affinity key.
    pub partition_key: String,
    /// Per-partition monotonic offset.
    pub offset: OffsetMarker,
    /// Production timestamp.
    pub produced_at: DateTime<Utc>,
    /// Decoded payload.
    pub payload: EventPayload,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to decode a single event.
///
/// Decode errors are isolated to the one event: the consumer logs and
/// skips the record so a malformed event never stalls its partition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// Bytes were not a valid payload for the topic's schema.
    #[error("malformed payload on topic {topic}: {reason}")]
    Malformed {
        /// Topic the record was consumed from.
        topic: Topic,
        /// Underlying serde failure.
        reason: String,
    },

    /// Payload decoded but belongs on a different topic.
    #[error("payload variant {variant} does not belong on topic {topic}")]
    TopicMismatch {
        /// Topic the record was consumed from.
        topic: Topic,
        /// The decoded variant's wire tag.
        variant: &'static str,
    },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    fn tick(symbol: &str, price: &str) -> EventPayload {
        EventPayload::MarketTick(MarketTick {
            schema_version: SCHEMA_VERSION,
            symbol: symbol.to_string(),
            price: Decimal::from_str(price).unwrap(),
            volume: 100,
            bid: None,
            ask: None,
        })
    }

    #[test_case("market-ticks", Some(Topic::MarketTicks); "market ticks")]
    #[test_case("order-events", Some(Topic::OrderEvents); "order events")]
    #[test_case("risk-events", Some(Topic::RiskEvents); "risk events")]
    #[test_case("alerts", Some(Topic::Alerts); "alerts")]
    #[test_case("portfolio-updates", None; "unknown topic")]
    fn topic_wire_names(name: &str, expected: Option<Topic>) {
        assert_eq!(Topic::from_wire(name), expected);
    }

    #[test]
    fn topic_round_trips_through_wire_name() {
        for topic in Topic::all() {
            assert_eq!(Topic::from_wire(topic.as_str()), Some(*topic));
        }
    }

    #[test]
    fn each_topic_has_distinct_consumer_group() {
        let groups: std::collections::HashSet<_> =
            Topic::all().iter().map(|t| t.consumer_group()).collect();
        assert_eq!(groups.len(), Topic::all().len());
    }

    #[test]
    fn offset_marker_ordering() {
        assert!(OffsetMarker::new(102).is_newer_than(OffsetMarker::new(101)));
        assert!(!OffsetMarker::new(101).is_newer_than(OffsetMarker::new(101)));
        assert!(!OffsetMarker::new(100).is_newer_than(OffsetMarker::new(101)));
    }

    #[test]
    fn payload_encode_decode_round_trip() {
        let payload = tick("AAPL", "178.50");
        let bytes = payload.encode().unwrap();
        let decoded = EventPayload::decode(Topic::MarketTicks, &bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_rejects_payload_on_wrong_topic() {
        let bytes = tick("AAPL", "178.50").encode().unwrap();
        let err = EventPayload::decode(Topic::RiskEvents, &bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TopicMismatch {
                topic: Topic::RiskEvents,
                variant: "market_tick",
            }
        ));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let err = EventPayload::decode(Topic::MarketTicks, b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let json = r#"{
            "type": "market_tick",
            "symbol": "AAPL",
            "price": "178.50",
            "volume": 10,
            "venue_latency_us": 42,
            "exchange": "XNAS"
        }"#;
        let decoded = EventPayload::decode(Topic::MarketTicks, json.as_bytes()).unwrap();
        let EventPayload::MarketTick(tick) = decoded else {
            panic!("expected market tick");
        };
        assert_eq!(tick.symbol, "AAPL");
    }

    #[test]
    fn decode_defaults_missing_schema_version() {
        let json = r#"{"type": "market_tick", "symbol": "AAPL", "price": "1.00"}"#;
        let decoded = EventPayload::decode(Topic::MarketTicks, json.as_bytes()).unwrap();
        let EventPayload::MarketTick(tick) = decoded else {
            panic!("expected market tick");
        };
        assert_eq!(tick.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn order_book_delta_belongs_on_market_ticks_topic() {
        let payload = EventPayload::OrderBookDelta(OrderBookDelta {
            schema_version: SCHEMA_VERSION,
            symbol: "AAPL".to_string(),
            bids: vec![],
            asks: vec![],
            sequence: 7,
        });
        assert_eq!(payload.topic(), Topic::MarketTicks);
    }

    #[test]
    fn partition_key_follows_entity() {
        let tick = tick("AAPL", "1.00");
        assert_eq!(tick.partition_key(), "AAPL");

        let risk = EventPayload::RiskEvent(RiskEvent {
            schema_version: SCHEMA_VERSION,
            portfolio_id: "P1".to_string(),
            var_95: Decimal::ZERO,
            var_99: Decimal::ZERO,
            exposure: Decimal::ZERO,
            beta: Decimal::ONE,
        });
        assert_eq!(risk.partition_key(), "P1");
    }
}
