//! Structural checks over whole ratchet stores.
//!
//! A scenario step reads the store into a [`StoreSnapshot`] and hands it to
//! an [`InvariantRegistry`]. Each registered [`Invariant`] looks at the
//! snapshot alone, so the same checks apply to memory, redb and chaotic
//! backends alike.
//!
//! ```ignore
//! let mut registry = InvariantRegistry::standard();
//! registry.add(ReceiveWindowFilled { receive_window: 4 });
//! registry.assert_store(&storage, "after the first unwrap");
//! ```

mod checks;
mod snapshot;

use std::fmt;

pub use checks::{
    ChannelsLoadable, KeyMaterialHasProvision, NewestProvisionPresent, ReceiveWindowFilled,
    SequenceBehindProvision,
};
use keyratchet_core::storage::Storage;
pub use snapshot::{ChannelSnapshot, StoreSnapshot};

/// Outcome of a single check.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Which check failed.
    pub invariant: &'static str,
    /// What the check found.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of a store snapshot.
pub trait Invariant: Send + Sync {
    /// Short identifier used in violation reports.
    fn name(&self) -> &'static str;

    /// Inspect `state` and report the first breach found.
    fn check(&self, state: &StoreSnapshot) -> InvariantResult;
}

/// Set of invariants run together.
#[derive(Default)]
pub struct InvariantRegistry {
    checks: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Registry with no checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that hold for every store regardless of configuration:
    /// [`ChannelsLoadable`], [`KeyMaterialHasProvision`],
    /// [`NewestProvisionPresent`] and [`SequenceBehindProvision`].
    ///
    /// [`ReceiveWindowFilled`] depends on the configured window and is
    /// added by the caller.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(ChannelsLoadable);
        registry.add(KeyMaterialHasProvision);
        registry.add(NewestProvisionPresent);
        registry.add(SequenceBehindProvision);
        registry
    }

    /// Register another check.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.checks.push(Box::new(invariant));
    }

    /// Names of the registered checks, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check and collect all violations.
    pub fn check_all(&self, state: &StoreSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.checks.iter().filter_map(|check| check.check(state).err()).collect();
        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every check, panicking with `context` if any fails.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &StoreSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let lines: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("store inconsistent {context}:\n  {}", lines.join("\n  "));
        }
    }

    /// Snapshot `storage` and run [`assert_all`](Self::assert_all) on it.
    #[allow(clippy::panic)]
    pub fn assert_store<S: Storage>(&self, storage: &S, context: &str) {
        match StoreSnapshot::capture(storage) {
            Ok(snapshot) => self.assert_all(&snapshot, context),
            Err(e) => panic!("cannot snapshot store {context}: {e}"),
        }
    }
}
