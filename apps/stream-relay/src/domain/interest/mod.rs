//! Interest Keys and Per-Connection Interest Sets
//!
//! Domain types describing what a client connection wants to receive.
//! An interest key names one cached entity (`tick:AAPL`, `risk:P1`);
//! keys group into channel categories, one fan-out channel per category.
//!
//! Listener lifecycles are explicit: the interest set reports when the
//! first key of a category is added and when the last is removed so the
//! connection attaches and detaches exactly one listener per category,
//! instead of funneling every notification through a global dispatcher.

use std::collections::{HashMap, HashSet};

use crate::domain::envelope::EventPayload;

// =============================================================================
// Channel Categories
// =============================================================================

/// Fan-out channel category, one per cache key namespace.
///
/// Named distinctly from the persisted log topics: categories exist only
/// for ephemeral notification fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelCategory {
    /// `tick:<symbol>` updates.
    Ticks,
    /// `orderbook:<symbol>` updates.
    OrderBooks,
    /// `order:<portfolioId>` updates.
    Orders,
    /// `risk:<portfolioId>` updates.
    Risk,
    /// `alert:<portfolioId>` updates.
    Alerts,
}

impl ChannelCategory {
    /// All categories.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Ticks,
            Self::OrderBooks,
            Self::Orders,
            Self::Risk,
            Self::Alerts,
        ]
    }

    /// Channel name, used for metrics labels and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::OrderBooks => "orderbooks",
            Self::Orders => "orders",
            Self::Risk => "risk",
            Self::Alerts => "alerts",
        }
    }

    /// Key namespace prefix for this category.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::Ticks => "tick",
            Self::OrderBooks => "orderbook",
            Self::Orders => "order",
            Self::Risk => "risk",
            Self::Alerts => "alert",
        }
    }
}

impl std::fmt::Display for ChannelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Interest Keys
// =============================================================================

/// Reference to the resource an authorization check is made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRef<'a> {
    /// Resource type understood by the authorization capability.
    pub resource_type: &'static str,
    /// Resource identifier.
    pub resource_id: &'a str,
}

/// A single cache/notification key a connection can declare interest in.
///
/// Wire form is `namespace:id`, e.g. `tick:AAPL` or `risk:P1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterestKey {
    /// Market tick for a symbol. Public.
    Tick(String),
    /// Order book for a symbol. Public.
    OrderBook(String),
    /// Order events for a portfolio. Private.
    Order(String),
    /// Risk metrics for a portfolio. Private.
    Risk(String),
    /// Alerts for a portfolio. Private.
    Alert(String),
}

impl InterestKey {
    /// Derive the key a payload is cached and fanned out under.
    #[must_use]
    pub fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::MarketTick(tick) => Self::Tick(tick.symbol.clone()),
            EventPayload::OrderBookDelta(delta) => Self::OrderBook(delta.symbol.clone()),
            EventPayload::OrderEvent(event) => Self::Order(event.portfolio_id.clone()),
            EventPayload::RiskEvent(event) => Self::Risk(event.portfolio_id.clone()),
            EventPayload::Alert(alert) => Self::Alert(alert.portfolio_id.clone()),
        }
    }

    /// Channel category the key belongs to.
    #[must_use]
    pub const fn category(&self) -> ChannelCategory {
        match self {
            Self::Tick(_) => ChannelCategory::Ticks,
            Self::OrderBook(_) => ChannelCategory::OrderBooks,
            Self::Order(_) => ChannelCategory::Orders,
            Self::Risk(_) => ChannelCategory::Risk,
            Self::Alert(_) => ChannelCategory::Alerts,
        }
    }

    /// Identifier component of the key.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Tick(id)
            | Self::OrderBook(id)
            | Self::Order(id)
            | Self::Risk(id)
            | Self::Alert(id) => id,
        }
    }

    /// The resource a subscriber must be authorized for, or `None` for
    /// public keys (market data is visible to unauthenticated connections).
    #[must_use]
    pub fn authorization_scope(&self) -> Option<ResourceRef<'_>> {
        match self {
            Self::Tick(_) | Self::OrderBook(_) => None,
            Self::Order(id) | Self::Risk(id) | Self::Alert(id) => Some(ResourceRef {
                resource_type: "portfolio",
                resource_id: id,
            }),
        }
    }

    /// Whether the key requires authentication and authorization.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.authorization_scope().is_some()
    }
}

impl std::str::FromStr for InterestKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, id) = s
            .split_once(':')
            .ok_or_else(|| ParseKeyError::Malformed(s.to_string()))?;

        if id.is_empty() {
            return Err(ParseKeyError::Malformed(s.to_string()));
        }

        match namespace {
            "tick" => Ok(Self::Tick(id.to_string())),
            "orderbook" => Ok(Self::OrderBook(id.to_string())),
            "order" => Ok(Self::Order(id.to_string())),
            "risk" => Ok(Self::Risk(id.to_string())),
            "alert" => Ok(Self::Alert(id.to_string())),
            other => Err(ParseKeyError::UnknownNamespace(other.to_string())),
        }
    }
}

impl std::fmt::Display for InterestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.category().namespace(), self.id())
    }
}

/// Failure to parse a wire interest key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    /// Key did not have the `namespace:id` shape.
    #[error("malformed interest key: {0}")]
    Malformed(String),

    /// Namespace is not one this node serves.
    #[error("unknown interest namespace: {0}")]
    UnknownNamespace(String),
}

// =============================================================================
// Interest Set
// =============================================================================

/// Outcome of removing a key from an interest set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// Whether the key was present.
    pub removed: bool,
    /// Whether the key's category has no remaining keys, meaning the
    /// category listener can be detached.
    pub category_now_empty: bool,
}

/// The set of keys one connection has declared interest in.
///
/// Owned exclusively by its connection task; never shared across
/// connections, so no locking is needed.
#[derive(Debug, Default)]
pub struct InterestSet {
    keys: HashSet<InterestKey>,
    per_category: HashMap<ChannelCategory, usize>,
}

impl InterestSet {
    /// Create an empty interest set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Returns `true` when the key's category had no prior
    /// keys, meaning a category listener must be attached.
    pub fn insert(&mut self, key: InterestKey) -> bool {
        let category = key.category();
        if !self.keys.insert(key) {
            return false;
        }

        let count = self.per_category.entry(category).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Remove a key. Idempotent: removing an absent key is a no-op.
    pub fn remove(&mut self, key: &InterestKey) -> RemoveOutcome {
        if !self.keys.remove(key) {
            return RemoveOutcome {
                removed: false,
                category_now_empty: false,
            };
        }

        let category = key.category();
        let remaining = self
            .per_category
            .get_mut(&category)
            .map(|count| {
                *count = count.saturating_sub(1);
                *count
            })
            .unwrap_or(0);

        if remaining == 0 {
            self.per_category.remove(&category);
        }

        RemoveOutcome {
            removed: true,
            category_now_empty: remaining == 0,
        }
    }

    /// Whether the set contains `key`.
    #[must_use]
    pub fn contains(&self, key: &InterestKey) -> bool {
        self.keys.contains(key)
    }

    /// Whether any key of `category` is present.
    #[must_use]
    pub fn has_category(&self, category: ChannelCategory) -> bool {
        self.per_category.contains_key(&category)
    }

    /// Number of declared keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case("tick:AAPL", InterestKey::Tick("AAPL".to_string()); "tick")]
    #[test_case("orderbook:MSFT", InterestKey::OrderBook("MSFT".to_string()); "orderbook")]
    #[test_case("order:P1", InterestKey::Order("P1".to_string()); "order")]
    #[test_case("risk:P1", InterestKey::Risk("P1".to_string()); "risk")]
    #[test_case("alert:P2", InterestKey::Alert("P2".to_string()); "alert")]
    fn parses_wire_keys(wire: &str, expected: InterestKey) {
        assert_eq!(InterestKey::from_str(wire).unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_namespace() {
        let err = InterestKey::from_str("position:P1").unwrap_err();
        assert_eq!(err, ParseKeyError::UnknownNamespace("position".to_string()));
    }

    #[test_case("AAPL"; "no separator")]
    #[test_case("tick:"; "empty id")]
    fn rejects_malformed_keys(wire: &str) {
        assert!(matches!(
            InterestKey::from_str(wire),
            Err(ParseKeyError::Malformed(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for wire in ["tick:AAPL", "orderbook:AAPL", "order:P1", "risk:P1", "alert:P1"] {
            let key = InterestKey::from_str(wire).unwrap();
            assert_eq!(key.to_string(), wire);
        }
    }

    #[test]
    fn market_data_keys_are_public() {
        assert!(!InterestKey::Tick("AAPL".to_string()).is_private());
        assert!(!InterestKey::OrderBook("AAPL".to_string()).is_private());
    }

    #[test]
    fn portfolio_scoped_keys_are_private() {
        let key = InterestKey::Risk("P1".to_string());
        let scope = key.authorization_scope().unwrap();
        assert_eq!(scope.resource_type, "portfolio");
        assert_eq!(scope.resource_id, "P1");
    }

    #[test]
    fn insert_reports_first_key_of_category() {
        let mut set = InterestSet::new();

        assert!(set.insert(InterestKey::Tick("AAPL".to_string())));
        // Second key in the same category: listener already attached.
        assert!(!set.insert(InterestKey::Tick("MSFT".to_string())));
        // Different category: needs its own listener.
        assert!(set.insert(InterestKey::Risk("P1".to_string())));
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut set = InterestSet::new();
        set.insert(InterestKey::Tick("AAPL".to_string()));
        assert!(!set.insert(InterestKey::Tick("AAPL".to_string())));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_reports_category_drained() {
        let mut set = InterestSet::new();
        set.insert(InterestKey::Tick("AAPL".to_string()));
        set.insert(InterestKey::Tick("MSFT".to_string()));

        let outcome = set.remove(&InterestKey::Tick("AAPL".to_string()));
        assert!(outcome.removed);
        assert!(!outcome.category_now_empty);

        let outcome = set.remove(&InterestKey::Tick("MSFT".to_string()));
        assert!(outcome.removed);
        assert!(outcome.category_now_empty);
        assert!(!set.has_category(ChannelCategory::Ticks));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut set = InterestSet::new();
        set.insert(InterestKey::Tick("AAPL".to_string()));

        let first = set.remove(&InterestKey::Tick("AAPL".to_string()));
        assert!(first.removed);

        let second = set.remove(&InterestKey::Tick("AAPL".to_string()));
        assert!(!second.removed);
        assert!(!second.category_now_empty);
    }

    #[test]
    fn key_of_payload_matches_namespace() {
        use rust_decimal::Decimal;

        use crate::domain::envelope::{MarketTick, SCHEMA_VERSION};

        let payload = EventPayload::MarketTick(MarketTick {
            schema_version: SCHEMA_VERSION,
            symbol: "AAPL".to_string(),
            price: Decimal::ONE,
            volume: 0,
            bid: None,
            ask: None,
        });
        assert_eq!(InterestKey::of(&payload).to_string(), "tick:AAPL");
    }
}
