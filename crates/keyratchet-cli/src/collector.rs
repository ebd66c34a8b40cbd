//! Garbage collection driver.
//!
//! Collection itself lives in the core crate; this module decides when it
//! runs. A failed pass is logged and retried on the next tick, since every
//! pass is safe to repeat.

use std::{future::Future, time::Duration};

use keyratchet_core::{
    Environment, GcReport, run_garbage_collection,
    storage::{Storage, StorageError},
};

/// Run one pass at the environment's current time.
pub fn collect_once<E: Environment, S: Storage>(
    env: &E,
    storage: &S,
) -> Result<GcReport, StorageError> {
    let report = run_garbage_collection(storage, env.now())?;
    tracing::info!(
        key_materials_deleted = report.key_materials_deleted,
        provisions_deleted = report.provisions_deleted,
        conflicts_skipped = report.conflicts_skipped,
        "Garbage collection pass complete"
    );
    Ok(report)
}

/// Run a pass every `interval` until `shutdown` resolves.
///
/// Returns the number of passes that ran.
pub async fn run_collector<E, S, F>(env: E, storage: S, interval: Duration, shutdown: F) -> u64
where
    E: Environment,
    S: Storage,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut passes = 0u64;

    loop {
        if let Err(e) = collect_once(&env, &storage) {
            tracing::warn!(error = %e, "Garbage collection pass failed");
        }
        passes += 1;

        tokio::select! {
            biased;
            () = &mut shutdown => {
                tracing::info!(passes, "Collector stopping");
                return passes;
            }
            () = env.sleep(interval) => {}
        }
    }
}
