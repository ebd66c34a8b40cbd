//! Maintenance of keyratchet channel stores.
//!
//! The `keyratchet` binary opens a store without an engine attached and
//! either collects expired key material (once, or periodically until
//! interrupted) or reports what the store holds. Both work on any
//! [`Storage`](keyratchet_core::storage::Storage) so they can be tested
//! against in-memory stores.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod collector;
mod error;
mod stats;

pub use collector::{collect_once, run_collector};
pub use error::CliError;
pub use stats::{ChannelStats, StoreStats};
