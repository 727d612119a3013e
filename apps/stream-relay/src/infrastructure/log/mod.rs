//! Event Log Infrastructure
//!
//! Adapters and reliability wrappers around the event log ports:
//!
//! - `retry`: the shared retry/backoff policy
//! - `producer`: the producer gateway with delivery guarantees
//! - `consumer`: the consumer group runner feeding the state cache
//! - `memory`: in-memory log adapter for tests and local development

pub mod consumer;
pub mod memory;
pub mod producer;
pub mod retry;

pub use consumer::{ConsumerError, ConsumerRunner, ConsumerState, ConsumerStatus};
pub use memory::InMemoryEventLog;
pub use producer::{DeliveryError, ProducerGateway};
pub use retry::{Backoff, RetryPolicy};
