//! Relay Configuration Settings
//!
//! Configuration types for the stream relay, loaded from environment
//! variables. Every knob has a default; only the JWT verification secret
//! is required.

use std::time::Duration;

use crate::domain::interest::ChannelCategory;

// =============================================================================
// Server Settings
// =============================================================================

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket fan-out server port.
    pub ws_port: u16,
    /// Health/ops HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8085,
            health_port: 8086,
        }
    }
}

// =============================================================================
// Consumer Settings
// =============================================================================

/// Consumer group runner settings, shared by all topic runners.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Maximum records fetched per batch.
    pub max_batch_size: usize,
    /// Delay before polling again after an empty fetch.
    pub poll_idle_delay: Duration,
    /// Grace period for draining in-flight work on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            poll_idle_delay: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Per-namespace cache TTLs.
///
/// Market data goes stale in seconds; risk metrics are recomputed on a
/// slower cadence and stay useful for minutes.
#[derive(Debug, Clone)]
pub struct CacheTtlSettings {
    /// TTL for `tick:<symbol>` entries.
    pub ticks: Duration,
    /// TTL for `orderbook:<symbol>` entries.
    pub order_books: Duration,
    /// TTL for `order:<portfolioId>` entries.
    pub orders: Duration,
    /// TTL for `risk:<portfolioId>` entries.
    pub risk: Duration,
    /// TTL for `alert:<portfolioId>` entries.
    pub alerts: Duration,
}

impl Default for CacheTtlSettings {
    fn default() -> Self {
        Self {
            ticks: Duration::from_secs(5),
            order_books: Duration::from_secs(2),
            orders: Duration::from_secs(30),
            risk: Duration::from_secs(300),
            alerts: Duration::from_secs(300),
        }
    }
}

impl CacheTtlSettings {
    /// TTL for a channel category.
    #[must_use]
    pub const fn for_category(&self, category: ChannelCategory) -> Duration {
        match category {
            ChannelCategory::Ticks => self.ticks,
            ChannelCategory::OrderBooks => self.order_books,
            ChannelCategory::Orders => self.orders,
            ChannelCategory::Risk => self.risk,
            ChannelCategory::Alerts => self.alerts,
        }
    }
}

// =============================================================================
// Notify Settings
// =============================================================================

/// Fan-out notification channel capacities.
#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// Capacity of the tick channel.
    pub ticks_capacity: usize,
    /// Capacity of the order book channel.
    pub order_books_capacity: usize,
    /// Capacity of the order event channel.
    pub orders_capacity: usize,
    /// Capacity of the risk channel.
    pub risk_capacity: usize,
    /// Capacity of the alert channel.
    pub alerts_capacity: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            ticks_capacity: 10_000,
            order_books_capacity: 10_000,
            orders_capacity: 1_000,
            risk_capacity: 1_000,
            alerts_capacity: 1_000,
        }
    }
}

// =============================================================================
// Fan-out Settings
// =============================================================================

/// Per-connection fan-out server settings.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the connection is force-closed.
    pub missed_pong_limit: u32,
    /// Outbound buffer capacity per subscribed key. When full, the oldest
    /// buffered frame for the key is dropped in favor of the newest.
    pub key_buffer_capacity: usize,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_pong_limit: 2,
            key_buffer_capacity: 16,
            max_connections: 1_000,
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff settings shared by the producer gateway and consumer runners.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Attempt cap for bounded retries.
    pub max_attempts: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Backoff delay cap.
    pub max_backoff: Duration,
    /// Exponential growth multiplier.
    pub multiplier: f64,
    /// Jitter factor as a fraction of the delay.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Authentication and authorization settings.
#[derive(Clone)]
pub struct AuthSettings {
    /// HMAC secret for the bundled JWT identity adapter.
    jwt_secret: String,
    /// Timeout for token verification during the handshake.
    pub verify_timeout: Duration,
    /// Timeout for authorization checks during subscribe. Timeouts deny.
    pub check_timeout: Duration,
    /// Static portfolio grant spec for the bundled access adapter,
    /// e.g. `alice:P1,P2;bob:P3`.
    pub grants_spec: Option<String>,
}

impl AuthSettings {
    /// Create auth settings.
    #[must_use]
    pub const fn new(
        jwt_secret: String,
        verify_timeout: Duration,
        check_timeout: Duration,
        grants_spec: Option<String>,
    ) -> Self {
        Self {
            jwt_secret,
            verify_timeout,
            check_timeout,
            grants_spec,
        }
    }

    /// The JWT verification secret.
    #[must_use]
    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"[REDACTED]")
            .field("verify_timeout", &self.verify_timeout)
            .field("check_timeout", &self.check_timeout)
            .field("grants_spec", &self.grants_spec)
            .finish()
    }
}

// =============================================================================
// Publish Settings
// =============================================================================

/// Producer gateway settings.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Per-attempt timeout on publish calls.
    pub publish_timeout: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Relay Configuration
// =============================================================================

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Server ports.
    pub server: ServerSettings,
    /// Consumer runner settings.
    pub consumer: ConsumerSettings,
    /// Cache TTLs per namespace.
    pub cache: CacheTtlSettings,
    /// Notification channel capacities.
    pub notify: NotifySettings,
    /// Fan-out server settings.
    pub fanout: FanoutSettings,
    /// Retry/backoff settings.
    pub retry: RetrySettings,
    /// Authentication settings.
    pub auth: AuthSettings,
    /// Producer gateway settings.
    pub publish: PublishSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `STREAM_RELAY_JWT_SECRET` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("STREAM_RELAY_JWT_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("STREAM_RELAY_JWT_SECRET".to_string()))?;

        if jwt_secret.is_empty() {
            return Err(ConfigError::EmptyValue(
                "STREAM_RELAY_JWT_SECRET".to_string(),
            ));
        }

        let server = ServerSettings {
            ws_port: parse_env_u16("STREAM_RELAY_WS_PORT", ServerSettings::default().ws_port),
            health_port: parse_env_u16(
                "STREAM_RELAY_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let consumer = ConsumerSettings {
            max_batch_size: parse_env_usize(
                "STREAM_RELAY_MAX_BATCH_SIZE",
                ConsumerSettings::default().max_batch_size,
            ),
            poll_idle_delay: parse_env_duration_millis(
                "STREAM_RELAY_POLL_IDLE_DELAY_MS",
                ConsumerSettings::default().poll_idle_delay,
            ),
            shutdown_grace: parse_env_duration_secs(
                "STREAM_RELAY_SHUTDOWN_GRACE_SECS",
                ConsumerSettings::default().shutdown_grace,
            ),
        };

        let cache = CacheTtlSettings {
            ticks: parse_env_duration_secs(
                "STREAM_RELAY_TTL_TICKS_SECS",
                CacheTtlSettings::default().ticks,
            ),
            order_books: parse_env_duration_secs(
                "STREAM_RELAY_TTL_ORDERBOOKS_SECS",
                CacheTtlSettings::default().order_books,
            ),
            orders: parse_env_duration_secs(
                "STREAM_RELAY_TTL_ORDERS_SECS",
                CacheTtlSettings::default().orders,
            ),
            risk: parse_env_duration_secs(
                "STREAM_RELAY_TTL_RISK_SECS",
                CacheTtlSettings::default().risk,
            ),
            alerts: parse_env_duration_secs(
                "STREAM_RELAY_TTL_ALERTS_SECS",
                CacheTtlSettings::default().alerts,
            ),
        };

        let fanout = FanoutSettings {
            heartbeat_interval: parse_env_duration_secs(
                "STREAM_RELAY_HEARTBEAT_INTERVAL_SECS",
                FanoutSettings::default().heartbeat_interval,
            ),
            missed_pong_limit: parse_env_u32(
                "STREAM_RELAY_MISSED_PONG_LIMIT",
                FanoutSettings::default().missed_pong_limit,
            ),
            key_buffer_capacity: parse_env_usize(
                "STREAM_RELAY_KEY_BUFFER_CAPACITY",
                FanoutSettings::default().key_buffer_capacity,
            ),
            max_connections: parse_env_usize(
                "STREAM_RELAY_MAX_CONNECTIONS",
                FanoutSettings::default().max_connections,
            ),
        };

        let retry = RetrySettings {
            max_attempts: parse_env_u32(
                "STREAM_RELAY_RETRY_MAX_ATTEMPTS",
                RetrySettings::default().max_attempts,
            ),
            initial_backoff: parse_env_duration_millis(
                "STREAM_RELAY_RETRY_INITIAL_BACKOFF_MS",
                RetrySettings::default().initial_backoff,
            ),
            max_backoff: parse_env_duration_secs(
                "STREAM_RELAY_RETRY_MAX_BACKOFF_SECS",
                RetrySettings::default().max_backoff,
            ),
            multiplier: parse_env_f64(
                "STREAM_RELAY_RETRY_MULTIPLIER",
                RetrySettings::default().multiplier,
            ),
            jitter_factor: parse_env_f64(
                "STREAM_RELAY_RETRY_JITTER_FACTOR",
                RetrySettings::default().jitter_factor,
            ),
        };

        let auth = AuthSettings {
            jwt_secret,
            verify_timeout: parse_env_duration_secs(
                "STREAM_RELAY_VERIFY_TIMEOUT_SECS",
                Duration::from_secs(5),
            ),
            check_timeout: parse_env_duration_secs(
                "STREAM_RELAY_CHECK_TIMEOUT_SECS",
                Duration::from_secs(5),
            ),
            grants_spec: std::env::var("STREAM_RELAY_PORTFOLIO_GRANTS").ok(),
        };

        let publish = PublishSettings {
            publish_timeout: parse_env_duration_secs(
                "STREAM_RELAY_PUBLISH_TIMEOUT_SECS",
                PublishSettings::default().publish_timeout,
            ),
        };

        Ok(Self {
            server,
            consumer,
            cache,
            notify: NotifySettings::default(),
            fanout,
            retry,
            auth,
            publish,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

// =============================================================================
// Tests
// =============================================================================
