//! Shared types for the autonomy multi-WAN failover daemon.
//!
//! This crate holds the data model (members, metrics, scores, events,
//! metered modes) and the RPC protocol messages exchanged with external
//! transports. It has no I/O and no runtime dependencies beyond serde.

pub mod models;
pub mod protocol;

pub use models::*;
