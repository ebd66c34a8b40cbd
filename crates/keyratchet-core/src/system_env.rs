//! Environment backed by the host clock and the OS random source.
//!
//! Timestamps come from `SystemTime` because they are persisted with
//! channels and key material and must be comparable across restarts.
//! Sleeping goes through tokio, so the collector driver needs a runtime.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::env::Environment;

/// Host environment for deployed engines.
///
/// # Panics
///
/// `random_bytes` panics if the OS random source fails, and
/// `wall_clock_secs` panics if the host clock reads before 1970. Neither
/// leaves the engine anything safe to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Environment reading the host clock and OS randomness.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("invariant: host clock reads after the Unix epoch")
            .as_secs()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS random source is available");
    }
}
