//! Garbage collection of obsolete key material.
//!
//! Two sweeps, always in this order within one pass:
//!
//! 1. Delete every key material whose expiration is strictly before `now`
//! 2. Delete every provision left without key material, except the newest
//!    generation of its channel
//!
//! Each channel's deletions are committed as one change set at the versions
//! that were read. A channel touched concurrently (a key consumed, a new
//! generation started) makes that commit conflict; it is skipped and picked
//! up by the next pass. Running a pass is therefore safe at any time and any
//! frequency.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    ChannelId, Timestamp,
    storage::{ChangeSet, KeyMaterialKey, Storage, StorageError},
};

/// What one garbage collection pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired key materials deleted
    pub key_materials_deleted: usize,
    /// Empty provisions deleted
    pub provisions_deleted: usize,
    /// Channels skipped because a concurrent writer touched them
    pub conflicts_skipped: usize,
}

/// Run one garbage collection pass.
///
/// # Errors
///
/// Any storage error other than a conflict aborts the pass. Work committed
/// before the failure stays committed.
pub fn run_garbage_collection<S: Storage>(
    storage: &S,
    now: Timestamp,
) -> Result<GcReport, StorageError> {
    let mut report = GcReport::default();

    let mut expired: BTreeMap<ChannelId, Vec<(KeyMaterialKey, u64)>> = BTreeMap::new();
    for (key, version) in storage.expired_key_materials(now)? {
        expired.entry(key.channel.clone()).or_default().push((key, version));
    }

    for (channel, keys) in expired {
        let count = keys.len();
        let mut changes = ChangeSet::new();
        for (key, version) in keys {
            changes.delete(key, version);
        }

        if commit_or_skip(storage, changes, &mut report)? {
            tracing::debug!(channel = %channel, deleted = count, "Collected expired key material");
            report.key_materials_deleted += count;
        }
    }

    for channel in storage.list_channels()? {
        sweep_empty_provisions(storage, &channel, &mut report)?;
    }

    if report.key_materials_deleted > 0 || report.provisions_deleted > 0 {
        tracing::info!(
            key_materials_deleted = report.key_materials_deleted,
            provisions_deleted = report.provisions_deleted,
            conflicts_skipped = report.conflicts_skipped,
            "Garbage collection pass complete"
        );
    }
    Ok(report)
}

fn sweep_empty_provisions<S: Storage>(
    storage: &S,
    channel: &ChannelId,
    report: &mut GcReport,
) -> Result<(), StorageError> {
    let Some(record) = storage.load_channel(channel)? else {
        return Ok(());
    };
    let newest = record.record.full_ratcheting_count_of_last_provision;

    // Provisions before key materials: a key minted after this read bumps
    // its provision past the version the delete expects
    let provisions = storage.load_provisions(channel)?;
    let populated: BTreeSet<u32> = storage
        .load_key_materials(channel)?
        .into_iter()
        .map(|(key, _)| key.full_ratcheting_count)
        .collect();

    let mut changes = ChangeSet::new();
    for (key, provision) in provisions {
        let generation = key.full_ratcheting_count;
        if generation != newest && !populated.contains(&generation) {
            changes.delete(key, provision.version);
        }
    }
    if changes.is_empty() {
        return Ok(());
    }

    let count = changes.len();
    // A new generation started since `newest` was read must not be swept
    changes.check(channel.clone(), Some(record.version));
    if commit_or_skip(storage, changes, report)? {
        tracing::debug!(channel = %channel, deleted = count, "Collected empty provisions");
        report.provisions_deleted += count;
    }
    Ok(())
}

/// Commit, treating a conflict as "skip this channel for now".
fn commit_or_skip<S: Storage>(
    storage: &S,
    changes: ChangeSet,
    report: &mut GcReport,
) -> Result<bool, StorageError> {
    match storage.commit(changes) {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => {
            tracing::debug!(error = %e, "Garbage collection skipped a busy channel");
            report.conflicts_skipped += 1;
            Ok(false)
        },
        Err(e) => Err(e),
    }
}
