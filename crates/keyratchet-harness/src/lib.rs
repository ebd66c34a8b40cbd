//! Deterministic test harness for the keyratchet channel engine.
//!
//! Test doubles for the engine's collaborators, two-device scenarios under a
//! simulated clock, a storage wrapper that interleaves a second writer at an
//! exact read, and invariant checks over whole stores.
//!
//! # Invariant Testing
//!
//! The `invariants` module reads a store into a snapshot and checks
//! structural properties (no orphan keys, the newest provision is present,
//! provision seeds never roll back). Use [`InvariantRegistry::standard()`]
//! after every step of a scenario.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod hooked;
pub mod invariants;
pub mod recorders;
pub mod scenario;

pub use directory::StaticDirectory;
pub use hooked::{HookedStorage, ReadPoint};
pub use invariants::{
    ChannelSnapshot, ChannelsLoadable, Invariant, InvariantRegistry, InvariantResult,
    KeyMaterialHasProvision, NewestProvisionPresent, ReceiveWindowFilled, SequenceBehindProvision,
    StoreSnapshot, Violation,
};
pub use recorders::{RecordingEvents, RecordingStarter};
pub use scenario::{Material, Peer, PeerPair, SCENARIO_START_SECS};
