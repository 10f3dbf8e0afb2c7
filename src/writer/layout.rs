//! On-disk batch layout and the atomic commit protocol
//!
//! A batch directory is `<base>/<schema>.<table>/<timestamp>/`. Files are
//! first produced under a sibling `.tmp-<uuid>` directory and renamed into
//! place in one step; the rename is the commit point. Anything still named
//! `.tmp-*` after a crash is garbage and is removed during recovery.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{CdcError, CdcResult};
use crate::model::TableId;
use crate::util::to_hex;

pub const STREAMING_FILE: &str = "streaming.csv.gz";
pub const FULL_RELOAD_FILE: &str = "full_reload.csv.gz";
pub const SCHEMA_FILE: &str = "schema.yml";
pub const DDL_FILE: &str = "ddl.txt";

const TMP_PREFIX: &str = ".tmp-";

/// Directory of one table's batches under the output base.
pub fn table_dir(base: &Path, table: &TableId) -> PathBuf {
    base.join(table.dir_name())
}

/// Pick the canonical directory for a batch timestamp, resolving collisions
/// with a monotonic suffix so no two batches of a table share a name.
pub fn batch_dir(
    base: &Path,
    table: &TableId,
    timestamp: DateTime<Utc>,
    format: &str,
) -> PathBuf {
    let stamp = timestamp.format(format).to_string();
    let parent = table_dir(base, table);
    let candidate = parent.join(&stamp);
    if !candidate.exists() {
        return candidate;
    }
    for n in 2.. {
        let candidate = parent.join(format!("{stamp}-{n}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("suffix search is unbounded")
}

/// Create the scratch directory a batch is staged in.
pub fn create_tmp_dir(base: &Path, table: &TableId) -> CdcResult<PathBuf> {
    let dir = table_dir(base, table).join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Commit a staged batch: fsync the staged files, rename into place, fsync
/// the parent so the rename itself is durable.
pub fn commit_tmp_dir(tmp: &Path, target: &Path) -> CdcResult<()> {
    for entry in fs::read_dir(tmp)? {
        let entry = entry?;
        File::open(entry.path())?.sync_all()?;
    }
    fs::rename(tmp, target)?;
    if let Some(parent) = target.parent() {
        // Directory fsync is advisory on some filesystems; ignore failures.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    debug!(target_dir = %target.display(), "committed batch directory");
    Ok(())
}

/// Best-effort removal of a staged or committed batch directory.
pub fn remove_batch_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "failed to remove batch directory: {e}");
        }
    }
}

/// Remove every `.tmp-*` directory under the base. Returns how many were
/// deleted.
pub fn remove_tmp_dirs(base: &Path) -> CdcResult<usize> {
    let mut removed = 0;
    for table_entry in read_dir_if_exists(base)? {
        let table_path = table_entry?.path();
        if !table_path.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&table_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() && name.starts_with(TMP_PREFIX) {
                fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Enumerate committed batch directories on disk as
/// `(table dir name, timestamp dir name, path)` triples.
pub fn scan_batch_dirs(base: &Path) -> CdcResult<Vec<(String, String, PathBuf)>> {
    let mut out = Vec::new();
    for table_entry in read_dir_if_exists(base)? {
        let table_path = table_entry?.path();
        let Some(table_name) = table_path.file_name().and_then(|n| n.to_str()).map(String::from)
        else {
            continue;
        };
        if !table_path.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&table_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if path.is_dir() && !name.starts_with(TMP_PREFIX) {
                out.push((table_name.clone(), name, path));
            }
        }
    }
    out.sort();
    Ok(out)
}

fn read_dir_if_exists(base: &Path) -> CdcResult<fs::ReadDir> {
    match fs::read_dir(base) {
        Ok(rd) => Ok(rd),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(base)?;
            Ok(fs::read_dir(base)?)
        }
        Err(e) => Err(CdcError::Io(e)),
    }
}

/// Facts recomputed from a data file during recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInspection {
    pub content_hash: String,
    pub row_count: i64,
    pub has_header: bool,
}

/// Recompute the content hash and row count of a compressed CSV data file.
/// The hash covers the compressed bytes, matching what was recorded at write
/// time; the row count excludes the header row of streaming files.
pub fn inspect_data_file(path: &Path, expect_header: bool) -> CdcResult<FileInspection> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let mut hasher = Sha256::new();
    hasher.update(&raw);
    let content_hash = to_hex(&hasher.finalize());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(expect_header)
        .flexible(true)
        .from_reader(GzDecoder::new(raw.as_slice()));
    let mut row_count = 0i64;
    for record in reader.records() {
        record.map_err(|e| CdcError::decode(format!("corrupt CSV in {}: {e}", path.display())))?;
        row_count += 1;
    }

    Ok(FileInspection {
        content_hash,
        row_count,
        has_header: expect_header,
    })
}

/// Inspection of an unregistered streaming file: recomputes the content hash
/// and row count, and recovers the batch's end LSN from the `_lsn` metadata
/// column so the file can be re-registered.
#[derive(Debug, Clone)]
pub struct StreamingInspection {
    pub content_hash: String,
    pub row_count: i64,
    pub end_lsn: Option<crate::lsn::Lsn>,
}

pub fn inspect_streaming_file(path: &Path) -> CdcResult<StreamingInspection> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let mut hasher = Sha256::new();
    hasher.update(&raw);
    let content_hash = to_hex(&hasher.finalize());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(GzDecoder::new(raw.as_slice()));
    let lsn_column = reader
        .headers()
        .map_err(|e| CdcError::decode(format!("corrupt CSV in {}: {e}", path.display())))?
        .iter()
        .position(|h| h == "_lsn");

    let mut row_count = 0i64;
    let mut end_lsn: Option<crate::lsn::Lsn> = None;
    for record in reader.records() {
        let record = record
            .map_err(|e| CdcError::decode(format!("corrupt CSV in {}: {e}", path.display())))?;
        row_count += 1;
        if let Some(idx) = lsn_column {
            if let Some(parsed) = record.get(idx).and_then(|v| v.parse().ok()) {
                end_lsn = Some(end_lsn.map_or(parsed, |current: crate::lsn::Lsn| {
                    current.max(parsed)
                }));
            }
        }
    }

    Ok(StreamingInspection {
        content_hash,
        row_count,
        end_lsn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn users() -> TableId {
        TableId::new("public", "users")
    }

    #[test]
    fn test_batch_dir_collision_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let format = "%Y-%m-%dT%H-%M-%S";

        let first = batch_dir(tmp.path(), &users(), ts, format);
        assert!(first.ends_with("public.users/2024-05-01T12-00-00"));
        fs::create_dir_all(&first).unwrap();

        let second = batch_dir(tmp.path(), &users(), ts, format);
        assert!(second.ends_with("2024-05-01T12-00-00-2"));
        fs::create_dir_all(&second).unwrap();

        let third = batch_dir(tmp.path(), &users(), ts, format);
        assert!(third.ends_with("2024-05-01T12-00-00-3"));
    }

    #[test]
    fn test_tmp_commit_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = create_tmp_dir(tmp.path(), &users()).unwrap();
        fs::write(staged.join("streaming.csv.gz"), b"x").unwrap();

        let orphan = create_tmp_dir(tmp.path(), &users()).unwrap();
        fs::write(orphan.join("partial"), b"y").unwrap();

        let target = table_dir(tmp.path(), &users()).join("2024-05-01T12-00-00");
        commit_tmp_dir(&staged, &target).unwrap();
        assert!(target.join("streaming.csv.gz").exists());
        assert!(!staged.exists());

        assert_eq!(remove_tmp_dirs(tmp.path()).unwrap(), 1);
        assert!(!orphan.exists());

        let dirs = scan_batch_dirs(tmp.path()).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, "public.users");
        assert_eq!(dirs[0].1, "2024-05-01T12-00-00");
    }

    #[test]
    fn test_inspect_data_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("streaming.csv.gz");

        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::new(6));
        enc.write_all(b"_op,_lsn,id\nI,0/10,1\nI,0/11,2\n").unwrap();
        enc.finish().unwrap().sync_all().unwrap();

        let inspection = inspect_data_file(&path, true).unwrap();
        assert_eq!(inspection.row_count, 2);
        assert_eq!(inspection.content_hash.len(), 64);

        // identical bytes hash identically
        let again = inspect_data_file(&path, true).unwrap();
        assert_eq!(inspection, again);
    }

    #[test]
    fn test_inspect_streaming_file_recovers_end_lsn() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("streaming.csv.gz");

        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::new(6));
        enc.write_all(
            b"_op,_lsn,_commit_time,id\nI,0/10,2024-05-01T12:00:00Z,1\nU,0/2A,2024-05-01T12:00:01Z,1\n",
        )
        .unwrap();
        enc.finish().unwrap().sync_all().unwrap();

        let inspection = inspect_streaming_file(&path).unwrap();
        assert_eq!(inspection.row_count, 2);
        assert_eq!(inspection.end_lsn, Some(crate::lsn::Lsn(0x2A)));
    }
}
