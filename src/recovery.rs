//! Startup recovery: find the newest valid snapshot, replay the WAL tail.
//!
//! Planning and execution are split so callers can inspect (and log) what a
//! restart is about to do. Execution is driven by two callbacks: one that
//! rebuilds state from snapshot sections and one that applies a single WAL
//! entry. Replay is idempotent — Insert on an existing id behaves as Update
//! and Delete on a missing id is a no-op — so a crash mid-recovery followed
//! by another recovery converges to the same state.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::snapshot::{self, SnapshotContents};
use crate::wal::{Wal, WalEntry};

/// What a restart will restore and replay.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// Newest snapshot whose magic and footer checksum validate, if any.
    pub snapshot_path: Option<PathBuf>,
    /// LSN the snapshot covers; 0 when starting from empty.
    pub snapshot_lsn: u64,
    /// First LSN to replay.
    pub wal_start_lsn: u64,
    /// Segment files whose LSN ranges intersect `(snapshot_lsn, ∞)`.
    pub wal_files: Vec<PathBuf>,
    pub estimated_ops: usize,
}

/// Outcome counters from an executed plan.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub snapshot_lsn: u64,
    pub replayed_entries: usize,
    /// True when replay stopped early at corrupt log data (partial restore).
    pub degraded: bool,
}

fn snapshots_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("snapshots")
}

fn wal_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("wal")
}

/// Build a recovery plan for `data_dir`. Invalid snapshots are skipped with
/// a warning; with no valid snapshot the plan starts from empty state and
/// replays the whole log.
pub fn plan(data_dir: &Path) -> Result<RecoveryPlan> {
    let snaps = snapshot::list_snapshots(&snapshots_dir(data_dir))?;

    let mut chosen: Option<(PathBuf, u64)> = None;
    for (path, _, _) in snaps {
        match snapshot::read_meta(&path) {
            Ok(meta) => {
                chosen = Some((path, meta.lsn));
                break;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid snapshot");
            }
        }
    }

    let (snapshot_path, snapshot_lsn) = match chosen {
        Some((path, lsn)) => (Some(path), lsn),
        None => (None, 0),
    };
    let wal_start_lsn = snapshot_lsn + 1;

    let wal_dir = wal_dir(data_dir);
    let wal_files = Wal::segments_after(&wal_dir, snapshot_lsn)?;
    let (tail, _) = Wal::read_dir_entries_tolerant(&wal_dir, wal_start_lsn)?;

    Ok(RecoveryPlan {
        snapshot_path,
        snapshot_lsn,
        wal_start_lsn,
        wal_files,
        estimated_ops: tail.len(),
    })
}

/// Execute a plan against caller-owned `state`. `restore` rebuilds
/// in-memory state from the snapshot (HNSW graphs are rebuilt by
/// re-inserting vectors, not by deserialising edges); `apply` replays one
/// WAL entry. Both closures receive `state` so the caller does not need
/// interior mutability.
pub fn execute<S, R, A>(
    data_dir: &Path,
    plan: &RecoveryPlan,
    state: &mut S,
    restore: R,
    mut apply: A,
) -> Result<RecoveryStats>
where
    R: FnOnce(&mut S, &SnapshotContents) -> Result<()>,
    A: FnMut(&mut S, &WalEntry) -> Result<()>,
{
    let mut stats = RecoveryStats {
        snapshot_lsn: plan.snapshot_lsn,
        ..Default::default()
    };

    if let Some(path) = &plan.snapshot_path {
        let contents = snapshot::read_snapshot(path)?;
        restore(state, &contents)?;
        info!(path = %path.display(), lsn = plan.snapshot_lsn, "restored snapshot");
    }

    let (entries, corrupt) =
        Wal::read_dir_entries_tolerant(&wal_dir(data_dir), plan.wal_start_lsn)?;
    if let Some(e) = corrupt {
        warn!(error = %e, "wal corruption during recovery; proceeding with partial restore");
        stats.degraded = true;
    }

    for entry in &entries {
        apply(state, entry)?;
        stats.replayed_entries += 1;
    }

    info!(
        snapshot_lsn = stats.snapshot_lsn,
        replayed = stats.replayed_entries,
        degraded = stats.degraded,
        "recovery complete"
    );
    Ok(stats)
}
