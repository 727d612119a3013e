//! Port Interfaces
//!
//! Interfaces (ports) for the external systems the relay depends on,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`event_log`]: producer/consumer contracts for the durable event log
//! - [`identity`]: token verification and authorization capabilities

pub mod event_log;
pub mod identity;

pub use event_log::{
    Assignment, CommittedOffsets, EventLogConsumerPort, EventLogProducerPort, LogError, LogRecord,
    ProducerRecord, RecordMeta,
};
pub use identity::{AccessError, AccessPort, AuthenticationError, Identity, IdentityPort};
