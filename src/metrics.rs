//! Passive metrics collection.
//!
//! The core does not export or aggregate; it counts. Everything here is a
//! plain atomic that hot paths bump and the embedding daemon scrapes via
//! [`MetricsCollector::snapshot`], which is a tear-free copy-out.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Engine-wide counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // WAL
    wal_appends_total: AtomicU64,
    wal_bytes_written: AtomicU64,
    wal_sync_total: AtomicU64,
    wal_checksum_errors_total: AtomicU64,
    // Snapshots
    snapshots_total: AtomicU64,
    snapshot_last_lsn: AtomicU64,
    // Operations
    mutations_total: AtomicU64,
    queries_total: AtomicU64,
    query_micros_total: AtomicI64,
    // Sessions
    sessions_created_total: AtomicU64,
    sessions_evicted_total: AtomicU64,
    quota_rejections_total: AtomicU64,
}

/// Copy of all metrics at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub wal_appends_total: u64,
    pub wal_bytes_written: u64,
    pub wal_sync_total: u64,
    pub wal_checksum_errors_total: u64,
    pub snapshots_total: u64,
    pub snapshot_last_lsn: u64,
    pub mutations_total: u64,
    pub queries_total: u64,
    pub query_micros_total: i64,
    pub sessions_created_total: u64,
    pub sessions_evicted_total: u64,
    pub quota_rejections_total: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_wal_append(&self, bytes: u64) {
        self.wal_appends_total.fetch_add(1, Ordering::Relaxed);
        self.wal_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_wal_sync(&self) {
        self.wal_sync_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_checksum_error(&self) {
        self.wal_checksum_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, lsn: u64) {
        self.snapshots_total.fetch_add(1, Ordering::Relaxed);
        self.snapshot_last_lsn.store(lsn, Ordering::Relaxed);
    }

    pub fn record_mutation(&self) {
        self.mutations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, micros: i64) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        self.query_micros_total.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_evicted(&self) {
        self.sessions_evicted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_rejection(&self) {
        self.quota_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wal_appends_total: self.wal_appends_total.load(Ordering::Relaxed),
            wal_bytes_written: self.wal_bytes_written.load(Ordering::Relaxed),
            wal_sync_total: self.wal_sync_total.load(Ordering::Relaxed),
            wal_checksum_errors_total: self.wal_checksum_errors_total.load(Ordering::Relaxed),
            snapshots_total: self.snapshots_total.load(Ordering::Relaxed),
            snapshot_last_lsn: self.snapshot_last_lsn.load(Ordering::Relaxed),
            mutations_total: self.mutations_total.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
            query_micros_total: self.query_micros_total.load(Ordering::Relaxed),
            sessions_created_total: self.sessions_created_total.load(Ordering::Relaxed),
            sessions_evicted_total: self.sessions_evicted_total.load(Ordering::Relaxed),
            quota_rejections_total: self.quota_rejections_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsCollector::new();
        m.record_wal_append(100);
        m.record_wal_append(50);
        m.record_query(1_000);
        m.record_snapshot(42);
        m.record_quota_rejection();

        let snap = m.snapshot();
        assert_eq!(snap.wal_appends_total, 2);
        assert_eq!(snap.wal_bytes_written, 150);
        assert_eq!(snap.queries_total, 1);
        assert_eq!(snap.query_micros_total, 1_000);
        assert_eq!(snap.snapshot_last_lsn, 42);
        assert_eq!(snap.quota_rejections_total, 1);
    }
}
