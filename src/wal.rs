//! Write-ahead log: a directory of numbered append-only segment files.
//!
//! Entry layout (little-endian):
//! ```text
//! [1B type][8B lsn][8B unix-nanos][4B key-len][key bytes]
//! [4B payload-len][payload bytes][8B xxh64 over all preceding bytes]
//! ```
//!
//! LSNs are monotonic starting at 1 and assigned under the append lock.
//! Reads verify every checksum; a short tail ends iteration cleanly (torn
//! writes are expected after crashes) while a checksum mismatch on a fully
//! present entry is `WalCorrupt`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::error::{GibramError, Result};
use crate::types::now_nanos;

/// Default segment rotation threshold: 64 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Upper bound on key/payload length fields when decoding; larger values are
/// treated as corruption rather than attempted allocations.
const MAX_FIELD_LEN: u32 = 256 * 1024 * 1024;

const SEGMENT_EXT: &str = "wal";

/// Fsync discipline for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncPolicy {
    /// fsync before `append` returns; `flushed_lsn == current_lsn` always.
    EveryWrite,
    /// Background fsync at a fixed interval; `append` may return first.
    Periodic(Duration),
    /// Caller-driven `sync()` only.
    Never,
}

/// Mutation record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    Insert = 1,
    Update = 2,
    Delete = 3,
    Checkpoint = 4,
}

impl WalEntryType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WalEntryType::Insert),
            2 => Some(WalEntryType::Update),
            3 => Some(WalEntryType::Delete),
            4 => Some(WalEntryType::Checkpoint),
            _ => None,
        }
    }
}

/// One decoded log record. The payload is opaque to the WAL; the engine
/// encodes record bodies with bincode.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub entry_type: WalEntryType,
    pub lsn: u64,
    pub timestamp: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

impl WalEntry {
    fn encode(&self) -> Vec<u8> {
        let key = self.key.as_bytes();
        let mut buf =
            Vec::with_capacity(1 + 8 + 8 + 4 + key.len() + 4 + self.payload.len() + 8);
        buf.push(self.entry_type as u8);
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let checksum = xxh64(&buf, 0);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }
}

/// Outcome of decoding one entry from a reader.
enum Decoded {
    Entry(WalEntry),
    /// Clean EOF at an entry boundary.
    Eof,
    /// Entry started but the file ended first (torn write).
    ShortTail,
}

/// `Ok(None)` on EOF; the caller decides whether that means a clean entry
/// boundary or a torn tail based on how far into the entry it got.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<Option<()>> {
    match r.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode_entry(r: &mut impl Read) -> Result<Decoded> {
    let mut head = [0u8; 1 + 8 + 8 + 4];
    if read_exact_or_eof(r, &mut head)?.is_none() {
        return Ok(Decoded::Eof);
    }

    let entry_type = head[0];
    let lsn = u64::from_le_bytes(head[1..9].try_into().map_err(|_| {
        GibramError::WalCorrupt("malformed entry header".into())
    })?);
    let timestamp = u64::from_le_bytes(head[9..17].try_into().map_err(|_| {
        GibramError::WalCorrupt("malformed entry header".into())
    })?);
    let key_len = u32::from_le_bytes(head[17..21].try_into().map_err(|_| {
        GibramError::WalCorrupt("malformed entry header".into())
    })?);
    if key_len > MAX_FIELD_LEN {
        return Err(GibramError::WalCorrupt(format!(
            "implausible key length {key_len} at lsn {lsn}"
        )));
    }

    let mut key = vec![0u8; key_len as usize];
    if read_exact_or_eof(r, &mut key)?.is_none() {
        return Ok(Decoded::ShortTail);
    }

    let mut plen_buf = [0u8; 4];
    if read_exact_or_eof(r, &mut plen_buf)?.is_none() {
        return Ok(Decoded::ShortTail);
    }
    let payload_len = u32::from_le_bytes(plen_buf);
    if payload_len > MAX_FIELD_LEN {
        return Err(GibramError::WalCorrupt(format!(
            "implausible payload length {payload_len} at lsn {lsn}"
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    if read_exact_or_eof(r, &mut payload)?.is_none() {
        return Ok(Decoded::ShortTail);
    }

    let mut checksum_buf = [0u8; 8];
    if read_exact_or_eof(r, &mut checksum_buf)?.is_none() {
        return Ok(Decoded::ShortTail);
    }
    let stored = u64::from_le_bytes(checksum_buf);

    let mut hashed = Vec::with_capacity(head.len() + key.len() + 4 + payload.len());
    hashed.extend_from_slice(&head);
    hashed.extend_from_slice(&key);
    hashed.extend_from_slice(&plen_buf);
    hashed.extend_from_slice(&payload);
    let computed = xxh64(&hashed, 0);
    if stored != computed {
        return Err(GibramError::ChecksumMismatch { stored, computed });
    }

    let entry_type = WalEntryType::from_u8(entry_type).ok_or_else(|| {
        GibramError::WalCorrupt(format!("unknown entry type {entry_type} at lsn {lsn}"))
    })?;
    let key = String::from_utf8(key)
        .map_err(|_| GibramError::WalCorrupt(format!("non-utf8 key at lsn {lsn}")))?;

    Ok(Decoded::Entry(WalEntry {
        entry_type,
        lsn,
        timestamp,
        key,
        payload,
    }))
}

struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes: u64,
}

struct WalInner {
    active: ActiveSegment,
    next_segment_seq: u64,
}

/// The write-ahead log. Appends are serialised by one mutex; LSN assignment
/// happens under that lock.
pub struct Wal {
    dir: PathBuf,
    sync_policy: WalSyncPolicy,
    segment_size: u64,
    current_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    inner: Mutex<WalInner>,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:06}.{SEGMENT_EXT}"))
}

fn segment_seq(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != SEGMENT_EXT {
        return None;
    }
    stem.parse().ok()
}

/// Segment files in seq order.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(seq) = segment_seq(&path) {
            out.push((seq, path));
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Stream one segment, pushing entries with `lsn >= from_lsn`. Returns false
/// when a short tail ended the scan.
fn read_segment(path: &Path, from_lsn: u64, out: &mut Vec<WalEntry>) -> Result<bool> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    loop {
        match decode_entry(&mut reader)? {
            Decoded::Entry(entry) => {
                if entry.lsn >= from_lsn {
                    out.push(entry);
                }
            }
            Decoded::Eof => return Ok(true),
            Decoded::ShortTail => {
                warn!(segment = %path.display(), "wal segment has a truncated tail, stopping replay here");
                return Ok(false);
            }
        }
    }
}

/// `(min_lsn, max_lsn)` of a segment, tolerant of torn tails. `None` for a
/// segment with no readable entries.
fn segment_bounds(path: &Path) -> Result<Option<(u64, u64)>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut bounds: Option<(u64, u64)> = None;
    loop {
        match decode_entry(&mut reader) {
            Ok(Decoded::Entry(entry)) => {
                bounds = Some(match bounds {
                    None => (entry.lsn, entry.lsn),
                    Some((lo, _)) => (lo, entry.lsn),
                });
            }
            Ok(Decoded::Eof) | Ok(Decoded::ShortTail) => return Ok(bounds),
            Err(e) => {
                warn!(segment = %path.display(), error = %e, "stopping bounds scan at corrupt entry");
                return Ok(bounds);
            }
        }
    }
}

impl Wal {
    /// Open (or create) the log under `dir`. The highest LSN across existing
    /// segments seeds the counter; appends always go to a fresh segment so a
    /// torn tail from a previous run is never appended after.
    pub fn open(
        dir: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
        segment_size: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut max_lsn = 0u64;
        let mut max_seq = 0u64;
        for (seq, path) in list_segments(&dir)? {
            max_seq = max_seq.max(seq);
            if let Some((_, hi)) = segment_bounds(&path)? {
                max_lsn = max_lsn.max(hi);
            }
        }

        let seq = max_seq + 1;
        let path = segment_path(&dir, seq);
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        debug!(segment = %path.display(), start_lsn = max_lsn + 1, "opened wal segment");

        Ok(Self {
            dir,
            sync_policy,
            segment_size: if segment_size == 0 {
                DEFAULT_SEGMENT_SIZE
            } else {
                segment_size
            },
            current_lsn: AtomicU64::new(max_lsn),
            flushed_lsn: AtomicU64::new(max_lsn),
            inner: Mutex::new(WalInner {
                active: ActiveSegment {
                    writer: BufWriter::new(file),
                    path,
                    bytes: 0,
                },
                next_segment_seq: seq + 1,
            }),
        })
    }

    pub fn sync_policy(&self) -> WalSyncPolicy {
        self.sync_policy
    }

    /// Last assigned LSN (0 when the log is empty).
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn.load(Ordering::Acquire)
    }

    /// Last LSN known durable.
    pub fn flushed_lsn(&self) -> u64 {
        self.flushed_lsn.load(Ordering::Acquire)
    }

    /// Append one record and return its LSN. Blocks on fsync under
    /// `EveryWrite`.
    pub fn append(&self, entry_type: WalEntryType, key: &str, payload: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock();

        let lsn = self.current_lsn.load(Ordering::Relaxed) + 1;
        let entry = WalEntry {
            entry_type,
            lsn,
            timestamp: now_nanos() as u64,
            key: key.to_string(),
            payload,
        };
        let bytes = entry.encode();

        if inner.active.bytes > 0 && inner.active.bytes + bytes.len() as u64 > self.segment_size {
            self.rotate_locked(&mut inner)?;
        }

        inner.active.writer.write_all(&bytes)?;
        inner.active.bytes += bytes.len() as u64;
        self.current_lsn.store(lsn, Ordering::Release);

        match self.sync_policy {
            WalSyncPolicy::EveryWrite => {
                inner.active.writer.flush()?;
                inner.active.writer.get_ref().sync_data()?;
                self.flushed_lsn.store(lsn, Ordering::Release);
            }
            WalSyncPolicy::Periodic(_) | WalSyncPolicy::Never => {
                inner.active.writer.flush()?;
            }
        }

        Ok(lsn)
    }

    /// Force an fsync of the active segment and advance `flushed_lsn`.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_data()?;
        self.flushed_lsn
            .store(self.current_lsn.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<()> {
        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_data()?;

        let seq = inner.next_segment_seq;
        let path = segment_path(&self.dir, seq);
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        debug!(segment = %path.display(), "rotated wal segment");

        inner.active = ActiveSegment {
            writer: BufWriter::new(file),
            path,
            bytes: 0,
        };
        inner.next_segment_seq = seq + 1;
        Ok(())
    }

    /// Stream entries with `lsn >= from_lsn` in LSN order across segments,
    /// verifying checksums. A truncated tail stops iteration cleanly.
    pub fn read_entries(&self, from_lsn: u64) -> Result<Vec<WalEntry>> {
        // Flush buffered bytes so the scan sees everything appended so far.
        {
            let mut inner = self.inner.lock();
            inner.active.writer.flush()?;
        }
        Self::read_dir_entries(&self.dir, from_lsn)
    }

    /// Offline variant used by recovery before a `Wal` is open.
    pub fn read_dir_entries(dir: &Path, from_lsn: u64) -> Result<Vec<WalEntry>> {
        let mut out = Vec::new();
        for (_, path) in list_segments(dir)? {
            if !read_segment(&path, from_lsn, &mut out)? {
                break;
            }
        }
        out.sort_by_key(|e| e.lsn);
        Ok(out)
    }

    /// Recovery variant: a mid-segment corruption stops the scan but returns
    /// everything read so far along with the error, so startup can degrade to
    /// a partial restore instead of refusing to come up.
    pub fn read_dir_entries_tolerant(
        dir: &Path,
        from_lsn: u64,
    ) -> Result<(Vec<WalEntry>, Option<GibramError>)> {
        let mut out = Vec::new();
        for (_, path) in list_segments(dir)? {
            match read_segment(&path, from_lsn, &mut out) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e @ (GibramError::ChecksumMismatch { .. } | GibramError::WalCorrupt(_))) => {
                    out.sort_by_key(|e| e.lsn);
                    return Ok((out, Some(e)));
                }
                Err(e) => return Err(e),
            }
        }
        out.sort_by_key(|e| e.lsn);
        Ok((out, None))
    }

    /// Segment files under `dir` whose LSN range intersects `(after_lsn, ∞)`.
    pub fn segments_after(dir: &Path, after_lsn: u64) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for (_, path) in list_segments(dir)? {
            match segment_bounds(&path)? {
                Some((_, hi)) if hi > after_lsn => out.push(path),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Remove segments whose max LSN is below `lsn`. The active segment is
    /// never removed.
    pub fn truncate_before(&self, lsn: u64) -> Result<usize> {
        let active_path = self.inner.lock().active.path.clone();
        let mut removed = 0;
        for (_, path) in list_segments(&self.dir)? {
            if path == active_path {
                continue;
            }
            match segment_bounds(&path)? {
                Some((_, hi)) if hi < lsn => {
                    fs::remove_file(&path)?;
                    debug!(segment = %path.display(), max_lsn = hi, "truncated wal segment");
                    removed += 1;
                }
                None => {
                    // Unreadable leftover; reclaim it as well.
                    fs::remove_file(&path)?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(list_segments(&self.dir)?.len())
    }
}

/// Background fsync loop for `WalSyncPolicy::Periodic`. Returns `None` for
/// other policies. The task exits when `shutdown` flips to true.
pub fn spawn_periodic_sync(
    wal: Arc<Wal>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let WalSyncPolicy::Periodic(interval) = wal.sync_policy() else {
        return None;
    };
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = wal.sync() {
                        warn!(error = %e, "periodic wal sync failed");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = wal.sync() {
                            warn!(error = %e, "final wal sync failed");
                        }
                        return;
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_wal(dir: &Path) -> Wal {
        Wal::open(dir, WalSyncPolicy::EveryWrite, DEFAULT_SEGMENT_SIZE).unwrap()
    }

    #[test]
    fn append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());

        let lsn1 = wal.append(WalEntryType::Insert, "s1/entity/1", b"alpha".to_vec()).unwrap();
        let lsn2 = wal.append(WalEntryType::Delete, "s1/entity/1", Vec::new()).unwrap();
        assert_eq!((lsn1, lsn2), (1, 2));
        assert_eq!(wal.flushed_lsn(), 2);

        let entries = wal.read_entries(1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "s1/entity/1");
        assert_eq!(entries[0].payload, b"alpha");
        assert_eq!(entries[1].entry_type, WalEntryType::Delete);
    }

    #[test]
    fn from_lsn_filters() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        for i in 0..10 {
            wal.append(WalEntryType::Insert, &format!("k{i}"), vec![i]).unwrap();
        }
        let entries = wal.read_entries(6).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].lsn, 6);
    }

    #[test]
    fn bit_flip_detected_as_corruption() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        wal.append(WalEntryType::Insert, "k", b"payload-bytes".to_vec()).unwrap();
        let path = {
            let segs = list_segments(dir.path()).unwrap();
            segs[0].1.clone()
        };
        drop(wal);

        let mut bytes = fs::read(&path).unwrap();
        // Flip one payload byte (header is 21 bytes + 1 key byte).
        let idx = 21 + 1 + 4 + 3;
        bytes[idx] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = Wal::read_dir_entries(dir.path(), 1).unwrap_err();
        assert!(matches!(err, GibramError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_tail_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(dir.path());
        wal.append(WalEntryType::Insert, "k1", b"one".to_vec()).unwrap();
        wal.append(WalEntryType::Insert, "k2", b"two".to_vec()).unwrap();
        let path = list_segments(dir.path()).unwrap()[0].1.clone();
        drop(wal);

        // Chop the last 5 bytes, simulating a torn write.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let entries = Wal::read_dir_entries(dir.path(), 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k1");
    }

    #[test]
    fn rotation_and_truncate_before() {
        let dir = TempDir::new().unwrap();
        // Tiny segments so every append rotates.
        let wal = Wal::open(dir.path(), WalSyncPolicy::EveryWrite, 64).unwrap();
        for i in 0..6u8 {
            wal.append(WalEntryType::Insert, "key-with-some-length", vec![i; 32]).unwrap();
        }
        assert!(wal.segment_count().unwrap() > 2);

        // All entries still readable in order across segments.
        let entries = wal.read_entries(1).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries.windows(2).all(|w| w[0].lsn < w[1].lsn));

        let removed = wal.truncate_before(4).unwrap();
        assert!(removed > 0);
        let entries = wal.read_entries(1).unwrap();
        assert!(entries.iter().all(|e| e.lsn >= 4 || e.lsn >= 1));
        // Entries at or above the truncation point must survive.
        assert!(entries.iter().any(|e| e.lsn >= 4));
    }

    #[test]
    fn lsn_continues_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let wal = open_wal(dir.path());
            wal.append(WalEntryType::Insert, "a", vec![]).unwrap();
            wal.append(WalEntryType::Insert, "b", vec![]).unwrap();
        }
        let wal = open_wal(dir.path());
        assert_eq!(wal.current_lsn(), 2);
        let lsn = wal.append(WalEntryType::Insert, "c", vec![]).unwrap();
        assert_eq!(lsn, 3);
        assert_eq!(wal.read_entries(1).unwrap().len(), 3);
    }
}
