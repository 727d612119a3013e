#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Stream Relay - Real-Time Event Distribution Core
//!
//! Consumes partitioned event-log topics in order, keeps a latest-value
//! state cache warm for synchronous reads, and fans matching updates out
//! to many concurrent WebSocket subscribers with per-connection interest
//! filtering, authentication, and bounded lossy-under-load buffering.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Event and subscription types with no I/O
//!   - `envelope`: topics, offset markers, tagged payloads
//!   - `interest`: interest keys, channel categories, interest sets
//!
//! - **Application**: Port definitions
//!   - `ports`: event log, identity, and authorization contracts
//!
//! - **Infrastructure**: Adapters and integrations
//!   - `log`: producer gateway, consumer group runner, retry policy
//!   - `cache`: compare-and-set state cache and notify hub
//!   - `ws`: WebSocket subscription fan-out server
//!   - `auth`: JWT verifier and static grant table
//!   - `config`: environment-driven settings
//!   - `health`: health/ingest HTTP surface
//!
//! # Data Flow
//!
//! ```text
//! Event Log topics ──► Consumer Group ──► State Cache ──► Notify ──► Fan-out ──► Client 1
//!  (market-ticks,        Runners           (CAS on         Hub        Server  ──► Client 2
//!   order-events,       (1 per topic)      offset marker)                     ──► Client N
//!   risk-events,
//!   alerts)
//!       ▲
//!       └── Producer Gateway ◄── upstream business actions / ingest webhooks
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core event distribution types with no external I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::envelope::{
    Alert, AlertSeverity, DecodeError, EventEnvelope, EventPayload, MarketTick, OffsetMarker,
    OrderBookDelta, OrderEvent, OrderSide, OrderStatus, OrderType, PriceLevel, RiskEvent, Topic,
};
pub use domain::interest::{ChannelCategory, InterestKey, InterestSet, ParseKeyError};

// Ports
pub use application::ports::event_log::{
    EventLogConsumerPort, EventLogProducerPort, LogError, LogRecord, ProducerRecord, RecordMeta,
};
pub use application::ports::identity::{
    AccessPort, AuthenticationError, Identity, IdentityPort,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig};

// Pipeline components
pub use infrastructure::cache::{Notification, NotifyHub, StateCache, WriteOutcome};
pub use infrastructure::log::{
    ConsumerRunner, ConsumerState, ConsumerStatus, DeliveryError, InMemoryEventLog,
    ProducerGateway, RetryPolicy,
};

// Fan-out server (for integration tests)
pub use infrastructure::ws::{FanoutServer, FanoutServerError};

// Auth adapters
pub use infrastructure::auth::{JwtIdentityVerifier, StaticAccessPolicy};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
