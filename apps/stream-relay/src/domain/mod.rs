//! Domain layer - Core event distribution types with no external I/O.

/// Event envelope: topics, offset markers, tagged payloads.
pub mod envelope;

/// Interest keys and per-connection interest sets.
pub mod interest;
