//! Subscription Wire Protocol
//!
//! JSON text frames over a persistent WebSocket connection.
//!
//! Client -> server:
//!
//! ```json
//! {"op": "subscribe", "key": "tick:AAPL"}
//! {"op": "unsubscribe", "key": "tick:AAPL"}
//! ```
//!
//! Server -> client, on update:
//!
//! ```json
//! {"key": "tick:AAPL", "value": {...}, "timestamp": "2025-11-04T14:30:00Z"}
//! ```
//!
//! Server -> client, on rejected subscribe:
//!
//! ```json
//! {"error": "FORBIDDEN", "message": "...", "key": "risk:P1"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::envelope::EventPayload;
use crate::infrastructure::cache::Notification;

// =============================================================================
// Client Requests
// =============================================================================

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Declare interest in a key.
    Subscribe {
        /// Wire interest key, e.g. `tick:AAPL`.
        key: String,
    },
    /// Withdraw interest in a key. Idempotent.
    Unsubscribe {
        /// Wire interest key.
        key: String,
    },
}

impl ClientRequest {
    /// Parse a client text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Server Frames
// =============================================================================

/// Rejection codes for subscribe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    /// Private key requested without an authenticated identity.
    AuthRequired,
    /// Authorization denied (or the authorization service was
    /// unreachable, which fails closed).
    Forbidden,
    /// Key namespace is not served by this node.
    UnknownKey,
    /// Frame was not a valid request.
    InvalidRequest,
}

impl RejectCode {
    /// Metric label for the rejection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::Forbidden => "forbidden",
            Self::UnknownKey => "unknown_key",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

/// Frame sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// A value update for a subscribed key.
    Update {
        /// Wire interest key.
        key: String,
        /// The latest payload for the key.
        value: EventPayload,
        /// Production timestamp of the underlying event.
        timestamp: DateTime<Utc>,
    },
    /// A rejected request.
    Error {
        /// Rejection code.
        error: RejectCode,
        /// Human-readable detail.
        message: String,
        /// Offending key, when one was parseable.
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

impl ServerFrame {
    /// Build an update frame from a notification.
    #[must_use]
    pub fn update(notification: &Notification) -> Self {
        Self::Update {
            key: notification.key.to_string(),
            value: notification.payload.clone(),
            timestamp: notification.produced_at,
        }
    }

    /// Build a rejection frame.
    #[must_use]
    pub fn error(code: RejectCode, message: impl Into<String>, key: Option<String>) -> Self {
        Self::Error {
            error: code,
            message: message.into(),
            key,
        }
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe() {
        let request = ClientRequest::parse(r#"{"op": "subscribe", "key": "tick:AAPL"}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::Subscribe {
                key: "tick:AAPL".to_string()
            }
        );
    }

    #[test]
    fn parses_unsubscribe() {
        let request = ClientRequest::parse(r#"{"op": "unsubscribe", "key": "risk:P1"}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::Unsubscribe {
                key: "risk:P1".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_op() {
        assert!(ClientRequest::parse(r#"{"op": "replay", "key": "tick:AAPL"}"#).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        assert!(ClientRequest::parse(r#"{"op": "subscribe"}"#).is_err());
    }

    #[test]
    fn error_frame_shape() {
        let frame = ServerFrame::error(
            RejectCode::Forbidden,
            "denied",
            Some("risk:P1".to_string()),
        );
        let text = frame.to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["error"], "FORBIDDEN");
        assert_eq!(value["message"], "denied");
        assert_eq!(value["key"], "risk:P1");
    }

    #[test]
    fn error_frame_omits_absent_key() {
        let frame = ServerFrame::error(RejectCode::InvalidRequest, "bad frame", None);
        let text = frame.to_text().unwrap();
        assert!(!text.contains("\"key\""));
    }

    #[test]
    fn update_frame_shape() {
        use rust_decimal::Decimal;

        use crate::domain::envelope::{MarketTick, OffsetMarker, SCHEMA_VERSION};
        use crate::domain::interest::InterestKey;

        let frame = ServerFrame::update(&Notification {
            key: InterestKey::Tick("AAPL".to_string()),
            payload: EventPayload::MarketTick(MarketTick {
                schema_version: SCHEMA_VERSION,
                symbol: "AAPL".to_string(),
                price: Decimal::new(17_850, 2),
                volume: 10,
                bid: None,
                ask: None,
            }),
            marker: OffsetMarker::new(101),
            produced_at: Utc::now(),
        });

        let text = frame.to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["key"], "tick:AAPL");
        assert_eq!(value["value"]["type"], "market_tick");
        assert!(value["timestamp"].is_string());
    }
}
