//! Keyratchet channel engine.
//!
//! Forward-secure, per-device-pair channels built on the primitives of
//! [`keyratchet_crypto`]. Each channel ratchets its send seed on every
//! wrapped message key, keeps a window of one-time receive keys provisioned
//! ahead of the peer, consumes each receive key at most once, and decides
//! when the seed lineage must be renewed by an out-of-band full ratchet.
//!
//! # Architecture
//!
//! ```text
//!            ChannelEngine<E: Environment, S: Storage>
//!   wrap / unwrap / lifecycle / queries / posting selection
//!                          │
//!            Channel aggregate (staged, versioned)
//!        send side · receive provisions · full-ratchet rules
//!                          │  one ChangeSet per operation
//!                          ▼
//!        Storage: MemoryStorage · RedbStorage · ChaoticStorage
//! ```
//!
//! Time and randomness come from an [`Environment`]; identity lookups,
//! lifecycle events and the full-ratchet protocol are injected through
//! [`Collaborators`]. Nothing is process-global.
//!
//! # Components
//!
//! - [`ChannelEngine`]: public operations
//! - [`storage`]: the optimistic-transaction store and its backends
//! - [`full_ratchet`]: the full-ratchet decision rules
//! - [`run_garbage_collection`]: expiry of obsolete key material
//! - [`SystemEnv`] / [`SimEnv`]: production and simulated environments

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod channel;
mod collaborators;
mod config;
mod engine;
mod env;
mod error;
mod gc;
mod posting;
pub mod storage;
mod system_env;
mod types;

pub use channel::full_ratchet::{self, FullRatchetState, FullRatchetTrigger};
pub use collaborators::{
    ChannelEvent, Collaborators, DirectoryError, EventSink, FullRatchetStarter, IdentityDirectory,
    StarterError,
};
pub use config::{DEFAULT_RECEIVE_WINDOW, EngineConfig};
pub use engine::{ChannelEngine, UnwrappedKey, WrappedKeyHeader};
pub use env::{Environment, SimEnv, Timestamp};
pub use error::EngineError;
pub use gc::{GcReport, run_garbage_collection};
pub use posting::{ChannelMessageToSend, ChannelType, MessageType};
pub use system_env::SystemEnv;
pub use types::{ChannelId, CryptoIdentity};
