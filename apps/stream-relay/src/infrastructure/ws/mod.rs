//! Subscription Fan-out Server
//!
//! WebSocket termination for many concurrent long-lived client
//! connections:
//!
//! - `protocol`: the JSON subscribe/unsubscribe wire protocol
//! - `server`: accept loop, handshake, and token verification
//! - `connection`: per-connection reader/writer task pair
//! - `buffer`: bounded per-key outbound buffer with drop-oldest overflow

pub mod buffer;
mod connection;
pub mod protocol;
pub mod server;

pub use buffer::OutboundBuffer;
pub use protocol::{ClientRequest, RejectCode, ServerFrame};
pub use server::{FanoutServer, FanoutServerError};
