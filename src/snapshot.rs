//! Atomic, gzip-compressed, sectioned snapshots.
//!
//! File layout:
//! ```text
//! [4B magic "GRAM"][4B version][4B flags][8B created-at nanos][8B lsn]
//! [8B checksum placeholder][12B reserved]            -- 48-byte header
//! [gzip stream of sections]                          -- body
//! [8B xxh64 of the compressed body]                  -- footer
//! ```
//!
//! Each section inside the stream is `[4B name-len][name][8B payload-len]
//! [payload]`. Unknown section names are skipped on read, so the format can
//! grow. Writes go to `<path>.tmp`, fsync, then rename; rename is the commit
//! point and the tmp file is removed on failure.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::error::{GibramError, Result};
use crate::types::now_nanos;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"GRAM";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_EXT: &str = "gibram";

const HEADER_LEN: usize = 48;
const FOOTER_LEN: usize = 8;

/// Section names, written in this order.
pub mod section {
    pub const SESSIONS: &str = "sessions";
    pub const DOCUMENTS: &str = "documents";
    pub const TEXT_UNITS: &str = "text_units";
    pub const ENTITIES: &str = "entities";
    pub const RELATIONSHIPS: &str = "relationships";
    pub const COMMUNITIES: &str = "communities";
    pub const ID_COUNTERS: &str = "id_counters";
    pub const HNSW_GRAPHS: &str = "hnsw_graphs";
}

/// Parsed header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub version: u32,
    pub flags: u32,
    pub created_at: i64,
    /// LSN pinned at Prepare time; WAL records at or below it are covered.
    pub lsn: u64,
}

/// `<timestamp>-<lsn>.gibram`
pub fn snapshot_file_name(created_at: i64, lsn: u64) -> String {
    format!("{created_at}-{lsn}.{SNAPSHOT_EXT}")
}

/// Parse `(timestamp, lsn)` out of a snapshot file name.
pub fn parse_snapshot_name(path: &Path) -> Option<(i64, u64)> {
    if path.extension()?.to_str()? != SNAPSHOT_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (ts, lsn) = stem.split_once('-')?;
    Some((ts.parse().ok()?, lsn.parse().ok()?))
}

/// Builds the sectioned body in memory, then commits it atomically.
pub struct SnapshotWriter {
    path: PathBuf,
    lsn: u64,
    created_at: i64,
    encoder: GzEncoder<Vec<u8>>,
}

impl SnapshotWriter {
    pub fn create(path: impl AsRef<Path>, lsn: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lsn,
            created_at: now_nanos(),
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    /// Append one named section with a bincode-encoded payload.
    pub fn section<T: Serialize>(&mut self, name: &str, payload: &T) -> Result<()> {
        let bytes = bincode::serialize(payload)
            .map_err(|e| GibramError::Internal(format!("encode snapshot section {name}: {e}")))?;
        self.raw_section(name, &bytes)
    }

    pub fn raw_section(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        let name_bytes = name.as_bytes();
        self.encoder
            .write_all(&(name_bytes.len() as u32).to_le_bytes())?;
        self.encoder.write_all(name_bytes)?;
        self.encoder
            .write_all(&(payload.len() as u64).to_le_bytes())?;
        self.encoder.write_all(payload)?;
        Ok(())
    }

    /// Finish the stream and commit: header + body + footer to `<path>.tmp`,
    /// flush, fsync, rename.
    pub fn finish(self) -> Result<SnapshotMeta> {
        let body = self
            .encoder
            .finish()
            .map_err(|e| GibramError::Internal(format!("finish snapshot stream: {e}")))?;
        let checksum = xxh64(&body, 0);

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&0u32.to_le_bytes());
        header[12..20].copy_from_slice(&self.created_at.to_le_bytes());
        header[20..28].copy_from_slice(&self.lsn.to_le_bytes());
        // Bytes 28..36 stay zero: the rolling checksum lives in the footer.

        let tmp_path = self.path.with_extension(format!("{SNAPSHOT_EXT}.tmp"));
        let write_result = (|| -> Result<()> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = std::io::BufWriter::new(file);
            writer.write_all(&header)?;
            writer.write_all(&body)?;
            writer.write_all(&checksum.to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), lsn = self.lsn, bytes = body.len(), "snapshot committed");

        Ok(SnapshotMeta {
            version: SNAPSHOT_VERSION,
            flags: 0,
            created_at: self.created_at,
            lsn: self.lsn,
        })
    }
}

/// Decoded snapshot: header plus raw section payloads in file order.
#[derive(Debug)]
pub struct SnapshotContents {
    pub meta: SnapshotMeta,
    sections: Vec<(String, Vec<u8>)>,
}

impl SnapshotContents {
    /// Decode a named section; `Ok(None)` when the section is absent.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some((_, bytes)) = self.sections.iter().find(|(n, _)| n == name) else {
            return Ok(None);
        };
        let value = bincode::deserialize(bytes).map_err(|e| {
            GibramError::SnapshotCorrupt(format!("section {name} failed to decode: {e}"))
        })?;
        Ok(Some(value))
    }

    pub fn section_names(&self) -> Vec<&str> {
        self.sections.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Validate magic, version, and footer checksum without decoding sections.
pub fn read_meta(path: &Path) -> Result<SnapshotMeta> {
    let bytes = fs::read(path)?;
    parse_header_and_verify(&bytes).map(|(meta, _)| meta)
}

/// Open and fully decode a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<SnapshotContents> {
    let bytes = fs::read(path)?;
    let (meta, body) = parse_header_and_verify(&bytes)?;

    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| GibramError::SnapshotCorrupt(format!("gzip stream: {e}")))?;

    let mut sections = Vec::new();
    let mut cursor = &decompressed[..];
    while !cursor.is_empty() {
        let (name, payload, rest) = read_section(cursor)?;
        sections.push((name, payload));
        cursor = rest;
    }

    Ok(SnapshotContents { meta, sections })
}

fn parse_header_and_verify(bytes: &[u8]) -> Result<(SnapshotMeta, &[u8])> {
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(GibramError::SnapshotCorrupt(format!(
            "file too small: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(GibramError::SnapshotCorrupt(format!(
            "bad magic: {:02x?}",
            &bytes[0..4]
        )));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default());
    if version != SNAPSHOT_VERSION {
        return Err(GibramError::SnapshotCorrupt(format!(
            "unsupported version {version}"
        )));
    }
    let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap_or_default());
    let created_at = i64::from_le_bytes(bytes[12..20].try_into().unwrap_or_default());
    let lsn = u64::from_le_bytes(bytes[20..28].try_into().unwrap_or_default());

    let body = &bytes[HEADER_LEN..bytes.len() - FOOTER_LEN];
    let stored = u64::from_le_bytes(
        bytes[bytes.len() - FOOTER_LEN..]
            .try_into()
            .unwrap_or_default(),
    );
    let computed = xxh64(body, 0);
    if stored != computed {
        return Err(GibramError::SnapshotCorrupt(format!(
            "footer checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
        )));
    }

    Ok((
        SnapshotMeta {
            version,
            flags,
            created_at,
            lsn,
        },
        body,
    ))
}

fn read_section(buf: &[u8]) -> Result<(String, Vec<u8>, &[u8])> {
    let short = || GibramError::SnapshotCorrupt("unexpected end of section stream".into());

    if buf.len() < 4 {
        return Err(short());
    }
    let name_len = u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default()) as usize;
    let buf = &buf[4..];
    if buf.len() < name_len + 8 {
        return Err(short());
    }
    let name = String::from_utf8(buf[..name_len].to_vec())
        .map_err(|_| GibramError::SnapshotCorrupt("non-utf8 section name".into()))?;
    let buf = &buf[name_len..];
    let payload_len = u64::from_le_bytes(buf[0..8].try_into().unwrap_or_default()) as usize;
    let buf = &buf[8..];
    if buf.len() < payload_len {
        return Err(short());
    }
    Ok((name, buf[..payload_len].to_vec(), &buf[payload_len..]))
}

/// Enumerate `*.gibram` files under `dir`, newest LSN first.
pub fn list_snapshots(dir: &Path) -> Result<Vec<(PathBuf, i64, u64)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some((ts, lsn)) = parse_snapshot_name(&path) {
            out.push((path, ts, lsn));
        }
    }
    out.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)));
    Ok(out)
}

/// Keep the newest `max_keep` snapshots, deleting the rest. Returns the
/// number removed.
pub fn prune_snapshots(dir: &Path, max_keep: usize) -> Result<usize> {
    if max_keep == 0 {
        return Ok(0);
    }
    let snapshots = list_snapshots(dir)?;
    let mut removed = 0;
    for (path, _, lsn) in snapshots.into_iter().skip(max_keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), lsn, "pruned old snapshot");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to prune snapshot"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(snapshot_file_name(123, 42));

        let mut writer = SnapshotWriter::create(&path, 42);
        writer
            .section(section::ENTITIES, &vec![(1u64, "ALPHA".to_string())])
            .unwrap();
        writer.section(section::ID_COUNTERS, &7u64).unwrap();
        let meta = writer.finish().unwrap();
        assert_eq!(meta.lsn, 42);

        let contents = read_snapshot(&path).unwrap();
        assert_eq!(contents.meta.lsn, 42);
        assert_eq!(
            contents.section_names(),
            vec![section::ENTITIES, section::ID_COUNTERS]
        );
        let entities: Vec<(u64, String)> = contents.decode(section::ENTITIES).unwrap().unwrap();
        assert_eq!(entities[0].1, "ALPHA");
        let counter: u64 = contents.decode(section::ID_COUNTERS).unwrap().unwrap();
        assert_eq!(counter, 7);
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(snapshot_file_name(1, 1));

        let mut writer = SnapshotWriter::create(&path, 1);
        writer.raw_section("future_section", b"whatever").unwrap();
        writer.section(section::ENTITIES, &Vec::<u64>::new()).unwrap();
        writer.finish().unwrap();

        let contents = read_snapshot(&path).unwrap();
        let missing: Option<Vec<u64>> = contents.decode("not_there").unwrap();
        assert!(missing.is_none());
        let entities: Option<Vec<u64>> = contents.decode(section::ENTITIES).unwrap();
        assert!(entities.is_some());
    }

    #[test]
    fn corrupted_body_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(snapshot_file_name(1, 5));

        let mut writer = SnapshotWriter::create(&path, 5);
        writer.section(section::ENTITIES, &vec![1u64, 2, 3]).unwrap();
        writer.finish().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let mid = HEADER_LEN + (bytes.len() - HEADER_LEN - FOOTER_LEN) / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read_meta(&path).unwrap_err(),
            GibramError::SnapshotCorrupt(_)
        ));
    }

    #[test]
    fn truncation_before_footer_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(snapshot_file_name(1, 9));

        let mut writer = SnapshotWriter::create(&path, 9);
        writer.section(section::DOCUMENTS, &vec![0u8; 1024]).unwrap();
        writer.finish().unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 32]).unwrap();

        assert!(matches!(
            read_snapshot(&path).unwrap_err(),
            GibramError::SnapshotCorrupt(_)
        ));
    }

    #[test]
    fn no_tmp_file_left_after_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(snapshot_file_name(7, 7));
        let mut writer = SnapshotWriter::create(&path, 7);
        writer.section(section::SESSIONS, &vec!["s1"]).unwrap();
        writer.finish().unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn list_orders_newest_lsn_first() {
        let dir = TempDir::new().unwrap();
        for (ts, lsn) in [(10, 5u64), (20, 50), (30, 25)] {
            let path = dir.path().join(snapshot_file_name(ts, lsn));
            let writer = SnapshotWriter::create(&path, lsn);
            writer.finish().unwrap();
        }
        let listed = list_snapshots(dir.path()).unwrap();
        let lsns: Vec<u64> = listed.iter().map(|(_, _, l)| *l).collect();
        assert_eq!(lsns, vec![50, 25, 5]);

        prune_snapshots(dir.path(), 2).unwrap();
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 2);
    }
}
