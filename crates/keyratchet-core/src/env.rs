//! Environment abstraction for deterministic testing.
//!
//! Decouples ratchet logic from system resources (wall clock, randomness).
//! Production code uses [`crate::SystemEnv`]; tests and simulations use
//! [`SimEnv`], whose clock only moves when told to and whose randomness is
//! seeded.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Wall-clock instant, in whole seconds since the Unix epoch.
///
/// Persisted with channels and key material, so it has to survive restarts
/// (unlike a monotonic `Instant`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Timestamp from seconds since the Unix epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Seconds since the Unix epoch.
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// `self + duration`, saturating at the far future.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        Duration::from_secs(self.0.saturating_sub(earlier.0))
    }
}

/// Abstract environment providing time and randomness.
///
/// # Invariants
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - `wall_clock_secs()` is the only source of time the engine consults
pub trait Environment: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;

    /// Current time as a [`Timestamp`].
    fn now(&self) -> Timestamp {
        Timestamp::from_secs(self.wall_clock_secs())
    }

    /// Sleeps for the specified duration.
    ///
    /// Only used by driver code (e.g. a periodic garbage collector), never by
    /// the ratchet logic itself.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);
}

/// Deterministic environment for tests and simulation.
///
/// The clock is set explicitly and randomness comes from a seeded ChaCha20
/// generator. Clones share the same clock and generator.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Create an environment starting at `start_secs` with a seeded RNG.
    pub fn new(start_secs: u64, rng_seed: u64) -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(start_secs)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(rng_seed))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.fetch_add(duration.as_secs(), Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set_time(&self, secs: u64) {
        self.clock.store(secs, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    fn wall_clock_secs(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_secs(100);
        assert_eq!(t.saturating_add(Duration::from_secs(50)).as_secs(), 150);
        assert_eq!(Timestamp::from_secs(u64::MAX).saturating_add(Duration::from_secs(1)).as_secs(), u64::MAX);
        assert_eq!(Timestamp::from_secs(150).elapsed_since(t), Duration::from_secs(50));
        assert_eq!(t.elapsed_since(Timestamp::from_secs(150)), Duration::ZERO);
    }

    #[test]
    fn sim_env_clock_is_shared_between_clones() {
        let env = SimEnv::new(1_000, 0);
        let clone = env.clone();

        clone.advance(Duration::from_secs(30));
        assert_eq!(env.wall_clock_secs(), 1_030);

        env.set_time(5);
        assert_eq!(clone.now(), Timestamp::from_secs(5));
    }

    #[test]
    fn sim_env_randomness_is_reproducible() {
        let a = SimEnv::new(0, 42);
        let b = SimEnv::new(0, 42);

        let mut bytes_a = [0u8; 32];
        let mut bytes_b = [0u8; 32];
        a.random_bytes(&mut bytes_a);
        b.random_bytes(&mut bytes_b);
        assert_eq!(bytes_a, bytes_b);

        a.random_bytes(&mut bytes_a);
        assert_ne!(bytes_a, bytes_b, "successive draws must differ");
    }
}
