//! Batch file production
//!
//! The sink trait covers the three capabilities the pipeline needs:
//! streaming batches, full-reload exports, and standalone DDL captures.
//! CSV + gzip is the shipped implementation; the trait leaves room for
//! alternate row formats and codecs.

pub mod layout;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;

use crate::change_buffer::TableBatchSnapshot;
use crate::config::OutputConfig;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{Change, ChangeKind, DdlEvent, FileRecord, FileType, TableId, TableSchema};
use crate::util::to_hex;

/// Outcome of a committed batch directory, ready for registration.
#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub table: TableId,
    pub directory: PathBuf,
    pub data_file: PathBuf,
    pub file_type: FileType,
    pub batch_timestamp: DateTime<Utc>,
    pub row_count: i64,
    pub content_hash: String,
    pub has_ddl: bool,
}

impl WrittenBatch {
    /// Registry row for this batch; the end LSN is determined by the caller
    /// (snapshot high-water mark, reload anchor, or END marker position).
    pub fn to_record(&self, end_lsn: Lsn) -> FileRecord {
        FileRecord {
            table: self.table.clone(),
            batch_timestamp: self.batch_timestamp,
            file_path: self.data_file.display().to_string(),
            file_type: self.file_type,
            end_lsn,
            row_count: self.row_count,
            has_ddl: self.has_ddl,
            content_hash: Some(self.content_hash.clone()),
        }
    }
}

/// Capability set of the file writer.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Materialize a streaming batch directory (`streaming.csv.gz`, plus
    /// `ddl.txt` when the snapshot carries DDL events). The snapshot is
    /// borrowed so a failed write can be restored into the buffer and
    /// retried.
    async fn write_streaming(
        &self,
        snapshot: &TableBatchSnapshot,
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch>;

    /// Materialize a full-reload directory from a stream of CSV chunks
    /// (`full_reload.csv.gz` + `schema.yml`). The chunks already carry a
    /// header row; `row_count` was determined at the export snapshot.
    async fn write_full_reload(
        &self,
        schema: TableSchema,
        rows: mpsc::Receiver<Bytes>,
        row_count: i64,
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch>;

    /// Materialize a DDL-only directory for events with no attributable
    /// table.
    async fn write_ddl(
        &self,
        table: &TableId,
        events: &[DdlEvent],
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch>;

    /// Remove a batch directory that failed registration.
    fn discard(&self, directory: &Path);
}

/// Counts and hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, to_hex(&self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Gzip + CSV implementation of [`BatchSink`].
#[derive(Debug, Clone)]
pub struct FileWriter {
    output: OutputConfig,
}

impl FileWriter {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    pub fn base_path(&self) -> &Path {
        &self.output.base_path
    }

    fn full_reload_compression(&self) -> Compression {
        Compression::new(self.output.compression.full_reload_level)
    }

    fn write_streaming_sync(
        output: &OutputConfig,
        snapshot: &TableBatchSnapshot,
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch> {
        let table = snapshot.table.clone();
        let tmp = layout::create_tmp_dir(&output.base_path, &table)?;

        let result = (|| -> CdcResult<(String, bool)> {
            let file = File::create(tmp.join(layout::STREAMING_FILE))?;
            let encoder = GzEncoder::new(
                HashingWriter::new(file),
                Compression::new(output.compression.level),
            );
            let mut csv = csv::Writer::from_writer(encoder);

            let mut header: Vec<&str> = vec!["_op", "_lsn", "_commit_time"];
            header.extend(snapshot.header.iter().map(String::as_str));
            csv.write_record(&header)?;

            let width = snapshot.header.len();
            for change in &snapshot.changes {
                for row in csv_rows_for_change(change, width, output.emit_update_old) {
                    csv.write_record(row)?;
                }
            }

            csv.flush()?;
            let encoder = csv.into_inner().map_err(|e| {
                CdcError::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
            })?;
            let hashing = encoder.finish()?;
            let (_file, hash) = hashing.finish();

            let has_ddl = !snapshot.ddl_events.is_empty();
            if has_ddl {
                write_ddl_file(&tmp.join(layout::DDL_FILE), &snapshot.ddl_events)?;
            }
            Ok((hash, has_ddl))
        })();

        let (hash, has_ddl) = match result {
            Ok(ok) => ok,
            Err(e) => {
                layout::remove_batch_dir(&tmp);
                return Err(e);
            }
        };

        let target = layout::batch_dir(
            &output.base_path,
            &table,
            timestamp,
            &output.timestamp_format,
        );
        layout::commit_tmp_dir(&tmp, &target)?;

        let row_count = emitted_row_count(snapshot, output.emit_update_old);
        info!(
            table = %table,
            dir = %target.display(),
            rows = row_count,
            "wrote streaming batch"
        );
        Ok(WrittenBatch {
            data_file: target.join(layout::STREAMING_FILE),
            directory: target,
            table,
            file_type: FileType::Streaming,
            batch_timestamp: timestamp,
            row_count,
            content_hash: hash,
            has_ddl,
        })
    }
}

/// Number of CSV data rows a snapshot expands to.
fn emitted_row_count(snapshot: &TableBatchSnapshot, emit_update_old: bool) -> i64 {
    snapshot
        .changes
        .iter()
        .map(|c| {
            if emit_update_old && c.kind == ChangeKind::Update && c.old_values.is_some() {
                2
            } else {
                1
            }
        })
        .sum()
}

/// Expand one change into its CSV rows: `_op`, `_lsn`, `_commit_time`,
/// then the data columns padded to the pinned header width.
fn csv_rows_for_change(
    change: &Change,
    width: usize,
    emit_update_old: bool,
) -> Vec<Vec<String>> {
    let meta = |op: &str| -> Vec<String> {
        vec![
            op.to_string(),
            change.lsn.to_string(),
            change
                .commit_time
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ]
    };
    let data = |values: Option<&Vec<Option<String>>>| -> Vec<String> {
        (0..width)
            .map(|i| {
                values
                    .and_then(|v| v.get(i))
                    .and_then(|v| v.clone())
                    .unwrap_or_default()
            })
            .collect()
    };
    let row = |op: &str, values: Option<&Vec<Option<String>>>| {
        let mut r = meta(op);
        r.extend(data(values));
        r
    };

    match change.kind {
        ChangeKind::Insert => vec![row("I", Some(&change.values))],
        ChangeKind::Update => {
            let mut rows = Vec::with_capacity(2);
            if emit_update_old {
                if let Some(old) = &change.old_values {
                    rows.push(row("UO", Some(old)));
                }
            }
            rows.push(row("U", Some(&change.values)));
            rows
        }
        // Deletes emit the old row; replica identity determines its columns.
        ChangeKind::Delete => vec![row("D", change.old_values.as_ref())],
        ChangeKind::Truncate => vec![row("T", None)],
    }
}

fn write_ddl_file(path: &Path, events: &[DdlEvent]) -> CdcResult<()> {
    let mut out = String::new();
    for event in events {
        out.push_str(&format!(
            "-- {} {}\n{}\n\n",
            event.captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            event.tag,
            event.command_text.trim_end(),
        ));
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[async_trait]
impl BatchSink for FileWriter {
    async fn write_streaming(
        &self,
        snapshot: &TableBatchSnapshot,
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch> {
        // Compression and fsync are blocking; keep them off the async
        // workers without cloning the snapshot.
        tokio::task::block_in_place(|| {
            Self::write_streaming_sync(&self.output, snapshot, timestamp)
        })
    }

    async fn write_full_reload(
        &self,
        schema: TableSchema,
        mut rows: mpsc::Receiver<Bytes>,
        row_count: i64,
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch> {
        let table = schema.table_id();
        let tmp = layout::create_tmp_dir(&self.output.base_path, &table)?;

        let result = async {
            let file = File::create(tmp.join(layout::FULL_RELOAD_FILE))?;
            let mut encoder =
                GzEncoder::new(HashingWriter::new(file), self.full_reload_compression());

            while let Some(chunk) = rows.recv().await {
                encoder.write_all(&chunk)?;
            }
            let hashing = encoder.finish()?;
            let (_file, hash) = hashing.finish();

            let descriptor = serde_yaml::to_string(&schema)
                .map_err(|e| CdcError::fatal(format!("schema descriptor serialization: {e}")))?;
            std::fs::write(tmp.join(layout::SCHEMA_FILE), descriptor)?;
            Ok::<String, CdcError>(hash)
        }
        .await;

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                layout::remove_batch_dir(&tmp);
                return Err(e);
            }
        };

        let target = layout::batch_dir(
            &self.output.base_path,
            &table,
            timestamp,
            &self.output.timestamp_format,
        );
        layout::commit_tmp_dir(&tmp, &target)?;

        info!(
            table = %table,
            dir = %target.display(),
            rows = row_count,
            "wrote full reload"
        );
        Ok(WrittenBatch {
            data_file: target.join(layout::FULL_RELOAD_FILE),
            directory: target,
            table,
            file_type: FileType::FullReload,
            batch_timestamp: timestamp,
            row_count,
            content_hash: hash,
            has_ddl: false,
        })
    }

    async fn write_ddl(
        &self,
        table: &TableId,
        events: &[DdlEvent],
        timestamp: DateTime<Utc>,
    ) -> CdcResult<WrittenBatch> {
        let tmp = layout::create_tmp_dir(&self.output.base_path, table)?;

        let ddl_path = tmp.join(layout::DDL_FILE);
        if let Err(e) = write_ddl_file(&ddl_path, events) {
            layout::remove_batch_dir(&tmp);
            return Err(e);
        }
        let mut hasher = Sha256::new();
        hasher.update(std::fs::read(&ddl_path)?);
        let hash = to_hex(&hasher.finalize());

        let target = layout::batch_dir(
            &self.output.base_path,
            table,
            timestamp,
            &self.output.timestamp_format,
        );
        layout::commit_tmp_dir(&tmp, &target)?;

        Ok(WrittenBatch {
            data_file: target.join(layout::DDL_FILE),
            directory: target,
            table: table.clone(),
            file_type: FileType::Ddl,
            batch_timestamp: timestamp,
            row_count: events.len() as i64,
            content_hash: hash,
            has_ddl: true,
        })
    }

    fn discard(&self, directory: &Path) {
        layout::remove_batch_dir(directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn output_config(base: &Path) -> OutputConfig {
        OutputConfig {
            base_path: base.to_path_buf(),
            ..OutputConfig::default()
        }
    }

    fn users() -> TableId {
        TableId::new("public", "users")
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn snapshot_with_changes() -> TableBatchSnapshot {
        let commit_time = ts();
        TableBatchSnapshot {
            table: users(),
            header: vec!["id".into(), "name".into()],
            changes: vec![
                Change {
                    kind: ChangeKind::Insert,
                    lsn: Lsn(0x10),
                    commit_time,
                    values: vec![Some("1".into()), Some("ada".into())],
                    old_values: None,
                },
                Change {
                    kind: ChangeKind::Update,
                    lsn: Lsn(0x20),
                    commit_time,
                    values: vec![Some("1".into()), Some("ada l".into())],
                    old_values: Some(vec![Some("1".into()), Some("ada".into())]),
                },
                Change {
                    kind: ChangeKind::Delete,
                    lsn: Lsn(0x30),
                    commit_time,
                    values: vec![],
                    old_values: Some(vec![Some("1".into()), None]),
                },
            ],
            ddl_events: vec![],
            bytes_estimate: 64,
            end_lsn: Lsn(0x30),
        }
    }

    fn read_gz_csv(path: &Path) -> Vec<Vec<String>> {
        let mut raw = Vec::new();
        File::open(path).unwrap().read_to_end(&mut raw).unwrap();
        let mut text = String::new();
        GzDecoder::new(raw.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(text.as_bytes());
        reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_batch_content() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = FileWriter::new(output_config(tmp.path()));

        let batch = writer
            .write_streaming(&snapshot_with_changes(), ts())
            .await
            .unwrap();
        assert_eq!(batch.file_type, FileType::Streaming);
        assert_eq!(batch.row_count, 3);
        assert!(!batch.has_ddl);
        assert!(batch.directory.ends_with("public.users/2024-05-01T12-00-00"));

        let rows = read_gz_csv(&batch.data_file);
        assert_eq!(rows[0], vec!["_op", "_lsn", "_commit_time", "id", "name"]);
        assert_eq!(rows[1][0], "I");
        assert_eq!(rows[1][3], "1");
        assert_eq!(rows[2][0], "U");
        assert_eq!(rows[2][4], "ada l");
        // delete carries the old image; NULL becomes empty
        assert_eq!(rows[3][0], "D");
        assert_eq!(rows[3][3], "1");
        assert_eq!(rows[3][4], "");
        assert_eq!(rows.len(), 4);

        // no stray temp dirs after commit
        assert_eq!(layout::remove_tmp_dirs(tmp.path()).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_update_old_image() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = output_config(tmp.path());
        config.emit_update_old = true;
        let writer = FileWriter::new(config);

        let batch = writer
            .write_streaming(&snapshot_with_changes(), ts())
            .await
            .unwrap();
        assert_eq!(batch.row_count, 4);

        let rows = read_gz_csv(&batch.data_file);
        assert_eq!(rows[2][0], "UO");
        assert_eq!(rows[2][4], "ada");
        assert_eq!(rows[3][0], "U");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_with_ddl_file() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = FileWriter::new(output_config(tmp.path()));

        let mut snapshot = snapshot_with_changes();
        snapshot.ddl_events.push(DdlEvent {
            captured_at: ts(),
            object_type: "table".into(),
            table: Some(users()),
            command_text: "ALTER TABLE public.users ADD COLUMN age int".into(),
            tag: "ALTER TABLE".into(),
            lsn: Lsn(0x40),
        });

        let batch = writer.write_streaming(&snapshot, ts()).await.unwrap();
        assert!(batch.has_ddl);
        let ddl = std::fs::read_to_string(batch.directory.join(layout::DDL_FILE)).unwrap();
        assert!(ddl.starts_with("-- 2024-05-01T12:00:00Z ALTER TABLE\n"));
        assert!(ddl.contains("ADD COLUMN age"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_reload_with_schema_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = FileWriter::new(output_config(tmp.path()));

        let schema = TableSchema {
            schema: "public".into(),
            table: "users".into(),
            columns: vec![crate::model::ColumnInfo {
                name: "id".into(),
                data_type: "integer".into(),
                nullable: false,
                default: None,
                length: None,
                is_primary_key: true,
            }],
            indexes: vec![],
            constraints: vec![],
            row_count: 2,
            exported_at: ts(),
        };

        let (tx, rx) = mpsc::channel(4);
        tx.send(Bytes::from_static(b"id\n1\n")).await.unwrap();
        tx.send(Bytes::from_static(b"2\n")).await.unwrap();
        drop(tx);

        let batch = writer
            .write_full_reload(schema.clone(), rx, 2, ts())
            .await
            .unwrap();
        assert_eq!(batch.file_type, FileType::FullReload);
        assert_eq!(batch.row_count, 2);

        let descriptor =
            std::fs::read_to_string(batch.directory.join(layout::SCHEMA_FILE)).unwrap();
        let parsed: TableSchema = serde_yaml::from_str(&descriptor).unwrap();
        assert_eq!(parsed.table, "users");
        assert_eq!(parsed.columns[0].name, "id");

        // hash recorded at write time matches a recovery-time inspection
        let inspection =
            layout::inspect_data_file(&batch.data_file, true).unwrap();
        assert_eq!(inspection.content_hash, batch.content_hash);
        assert_eq!(inspection.row_count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ddl_only_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = FileWriter::new(output_config(tmp.path()));

        let batch = writer
            .write_ddl(
                &TableId::global_ddl_bucket(),
                &[DdlEvent {
                    captured_at: ts(),
                    object_type: "function".into(),
                    table: None,
                    command_text: "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql".into(),
                    tag: "CREATE FUNCTION".into(),
                    lsn: Lsn(0x50),
                }],
                ts(),
            )
            .await
            .unwrap();
        assert_eq!(batch.file_type, FileType::Ddl);
        assert!(batch.directory.ends_with("_global/2024-05-01T12-00-00"));
        assert!(batch.data_file.exists());
    }
}
