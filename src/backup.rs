//! Two-phase backup coordination.
//!
//! **Prepare** forces a WAL sync and pins the resulting `flushed_lsn`.
//! **Commit** runs the caller-supplied section writer under the
//! coordinator's lease and produces the atomic snapshot file stamped with
//! the prepared LSN. Mutations may continue while Commit runs; the writer
//! captures each section under the store's read guard, so the snapshot is a
//! consistent cut at Prepare time. After a successful commit, WAL segments
//! whose LSNs fall at or below the snapshot LSN are reclaimable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::snapshot::{self, SnapshotWriter};
use crate::types::now_nanos;
use crate::wal::Wal;

/// Result of a committed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveInfo {
    pub path: PathBuf,
    pub lsn: u64,
    pub created_at: i64,
    pub duration_micros: i64,
}

/// Token returned by `prepare`; holds the pinned LSN.
#[derive(Debug, Clone, Copy)]
pub struct PreparedBackup {
    lsn: u64,
}

impl PreparedBackup {
    pub fn lsn(&self) -> u64 {
        self.lsn
    }
}

/// Serialises snapshot production against itself; WAL appends continue
/// concurrently.
pub struct BackupCoordinator {
    wal: Arc<Wal>,
    snapshots_dir: PathBuf,
    max_keep: usize,
    lease: Mutex<()>,
}

impl BackupCoordinator {
    pub fn new(wal: Arc<Wal>, snapshots_dir: impl AsRef<Path>, max_keep: usize) -> Result<Self> {
        let snapshots_dir = snapshots_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&snapshots_dir)?;
        Ok(Self {
            wal,
            snapshots_dir,
            max_keep,
            lease: Mutex::new(()),
        })
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Phase one: make every append so far durable and pin the LSN the
    /// snapshot will cover.
    pub fn prepare(&self) -> Result<PreparedBackup> {
        if self.wal.flushed_lsn() < self.wal.current_lsn() {
            self.wal.sync()?;
        }
        Ok(PreparedBackup {
            lsn: self.wal.flushed_lsn(),
        })
    }

    /// Phase two: produce the snapshot under the lease. `write_sections`
    /// receives the open writer and appends each section.
    pub fn commit<F>(&self, prepared: PreparedBackup, write_sections: F) -> Result<SaveInfo>
    where
        F: FnOnce(&mut SnapshotWriter) -> Result<()>,
    {
        let _lease = self.lease.lock();
        let start = Instant::now();

        let created_at = now_nanos();
        let path = self
            .snapshots_dir
            .join(snapshot::snapshot_file_name(created_at, prepared.lsn));

        let mut writer = SnapshotWriter::create(&path, prepared.lsn);
        write_sections(&mut writer)?;
        let meta = writer.finish()?;

        if self.max_keep > 0 {
            if let Err(e) = snapshot::prune_snapshots(&self.snapshots_dir, self.max_keep) {
                warn!(error = %e, "snapshot retention pruning failed");
            }
        }

        let info = SaveInfo {
            path,
            lsn: meta.lsn,
            created_at: meta.created_at,
            duration_micros: start.elapsed().as_micros() as i64,
        };
        info!(path = %info.path.display(), lsn = info.lsn, "backup committed");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{list_snapshots, read_snapshot, section};
    use crate::wal::{WalEntryType, WalSyncPolicy};
    use tempfile::TempDir;

    fn coordinator(dir: &Path) -> (Arc<Wal>, BackupCoordinator) {
        let wal = Arc::new(Wal::open(dir.join("wal"), WalSyncPolicy::Never, 0).unwrap());
        let coord = BackupCoordinator::new(wal.clone(), dir.join("snapshots"), 3).unwrap();
        (wal, coord)
    }

    #[test]
    fn prepare_forces_durability() {
        let dir = TempDir::new().unwrap();
        let (wal, coord) = coordinator(dir.path());

        wal.append(WalEntryType::Insert, "k1", vec![1]).unwrap();
        wal.append(WalEntryType::Insert, "k2", vec![2]).unwrap();
        assert!(wal.flushed_lsn() < wal.current_lsn());

        let prepared = coord.prepare().unwrap();
        assert_eq!(prepared.lsn(), 2);
        assert_eq!(wal.flushed_lsn(), 2);
    }

    #[test]
    fn commit_writes_snapshot_at_prepared_lsn() {
        let dir = TempDir::new().unwrap();
        let (wal, coord) = coordinator(dir.path());

        wal.append(WalEntryType::Insert, "k1", vec![1]).unwrap();
        let prepared = coord.prepare().unwrap();

        // Appends between prepare and commit are not covered by the snapshot.
        wal.append(WalEntryType::Insert, "k2", vec![2]).unwrap();

        let info = coord
            .commit(prepared, |w| w.section(section::ENTITIES, &vec![9u64]))
            .unwrap();
        assert_eq!(info.lsn, 1);

        let contents = read_snapshot(&info.path).unwrap();
        assert_eq!(contents.meta.lsn, 1);
        let entities: Vec<u64> = contents.decode(section::ENTITIES).unwrap().unwrap();
        assert_eq!(entities, vec![9]);
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let (wal, coord) = coordinator(dir.path());

        for i in 0..5u8 {
            wal.append(WalEntryType::Insert, "k", vec![i]).unwrap();
            let prepared = coord.prepare().unwrap();
            coord
                .commit(prepared, |w| w.section(section::SESSIONS, &Vec::<String>::new()))
                .unwrap();
        }
        let kept = list_snapshots(&dir.path().join("snapshots")).unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].2, 5);
    }
}
