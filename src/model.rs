//! Core data model for the CDC egress service
//!
//! This module contains the domain types shared across the pipeline:
//! - Table identity and row-level change records
//! - Captured DDL events and in-WAL reload markers
//! - Table schema descriptors produced at export time
//! - Registry rows: file records, per-table state, reload operations
//!
//! Registry-row types serialize to and from the bookkeeping tables owned by
//! the registry; descriptor types serialize to YAML with a fixed field order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;

/// Identity of a source table: `(schema, name)`, case-sensitive.
///
/// Used as the primary key everywhere a table is referenced, including the
/// on-disk layout where a table's batches live under `<schema>.<name>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new<S: Into<String>, N: Into<String>>(schema: S, name: N) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Pseudo-table collecting DDL events not attributable to any
    /// configured table.
    pub fn global_ddl_bucket() -> Self {
        TableId::new("", "_global")
    }

    /// Directory component for this table's batches.
    pub fn dir_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }

    /// Double-quoted form for SQL statements.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Kind of a row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Bulk delete of all rows; carries no column data.
    Truncate,
}

impl ChangeKind {
    /// Single-letter operation code used in the `_op` CSV metadata column.
    pub fn op_code(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "I",
            ChangeKind::Update => "U",
            ChangeKind::Delete => "D",
            ChangeKind::Truncate => "T",
        }
    }
}

/// One row-level event decoded from the replication stream.
///
/// Column values are positional, aligned with the column order pinned by the
/// latest Relation message for the table (the buffer records that header).
/// `old_values` is present for updates and deletes when the table's replica
/// identity provides the old image.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    /// LSN of the enclosing commit.
    pub lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    pub values: Vec<Option<String>>,
    pub old_values: Option<Vec<Option<String>>>,
}

/// Captured DDL observed as an insert on the designated `ddl_history` table.
#[derive(Debug, Clone)]
pub struct DdlEvent {
    pub captured_at: DateTime<Utc>,
    pub object_type: String,
    /// Affected table, best effort; None for non-table DDL.
    pub table: Option<TableId>,
    pub command_text: String,
    pub tag: String,
    pub lsn: Lsn,
}

/// Action carried by a reload marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerAction {
    #[serde(rename = "EXPORT_START")]
    ExportStart,
    #[serde(rename = "EXPORT_END")]
    ExportEnd,
}

/// JSON payload embedded in a reload marker comment, after the fixed prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub action: MarkerAction,
    pub export_id: Uuid,
    pub schema: String,
    pub table: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_exported: Option<u64>,
}

/// A reload synchronization point parsed out of a `COMMENT ON TABLE` DDL.
///
/// Markers are captured in the WAL, so every consumer observes them at the
/// same LSN; that position is the sole synchronization primitive the reload
/// protocol needs.
#[derive(Debug, Clone)]
pub struct ReloadMarker {
    pub action: MarkerAction,
    pub export_id: Uuid,
    pub table: TableId,
    pub timestamp: DateTime<Utc>,
    pub rows_exported: Option<u64>,
    /// LSN at which the comment appears in the WAL.
    pub lsn: Lsn,
}

impl ReloadMarker {
    /// Parse a marker out of a DDL command text if its comment body starts
    /// with `prefix`. Returns `Ok(None)` when the command is not a marker at
    /// all; `Err(MarkerMalformed)` when it claims to be one but does not parse.
    pub fn parse(prefix: &str, command_text: &str, lsn: Lsn) -> CdcResult<Option<ReloadMarker>> {
        let Some(body) = extract_comment_body(command_text) else {
            return Ok(None);
        };
        let Some(rest) = body.strip_prefix(prefix) else {
            return Ok(None);
        };
        let payload: MarkerPayload = serde_json::from_str(rest.trim())
            .map_err(|e| CdcError::marker(format!("bad payload: {e}")))?;
        Ok(Some(ReloadMarker {
            action: payload.action,
            export_id: payload.export_id,
            table: TableId::new(payload.schema, payload.table),
            timestamp: payload.timestamp,
            rows_exported: payload.rows_exported,
            lsn,
        }))
    }

    /// Render the `COMMENT ON TABLE` statement that plants this marker.
    pub fn to_sql(&self, prefix: &str) -> String {
        let payload = MarkerPayload {
            action: self.action,
            export_id: self.export_id,
            schema: self.table.schema.clone(),
            table: self.table.name.clone(),
            timestamp: self.timestamp,
            rows_exported: self.rows_exported,
        };
        let json = serde_json::to_string(&payload).expect("marker payload serializes");
        format!(
            "COMMENT ON TABLE {} IS '{}{}'",
            self.table.qualified(),
            prefix,
            json.replace('\'', "''")
        )
    }
}

/// Pull the string literal out of `COMMENT ON TABLE x IS '...'`.
fn extract_comment_body(command_text: &str) -> Option<String> {
    let upper = command_text.to_uppercase();
    // Byte offsets into `upper` only index `command_text` when uppercasing
    // changed nothing length-wise; marker comments are plain ASCII.
    if upper.len() != command_text.len() {
        return None;
    }
    if !upper.trim_start().starts_with("COMMENT ON TABLE") {
        return None;
    }
    let is_pos = upper.find(" IS ")?;
    let literal = command_text[is_pos + 4..].trim().trim_end_matches(';').trim();
    let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

/// Metadata for one column of an exported table, in catalog order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub is_unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub constraint_type: String,
    pub definition: String,
}

/// Schema descriptor produced at export time from the source catalog.
///
/// Serialized as `schema.yml` beside a full reload. Field order is fixed by
/// declaration order so the file is byte-stable for identical inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub row_count: i64,
    pub exported_at: DateTime<Utc>,
}

impl TableSchema {
    pub fn table_id(&self) -> TableId {
        TableId::new(self.schema.clone(), self.table.clone())
    }
}

/// Kind of a registered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Streaming,
    FullReload,
    Ddl,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Streaming => "streaming",
            FileType::FullReload => "full_reload",
            FileType::Ddl => "ddl",
        }
    }

    pub fn parse(s: &str) -> CdcResult<Self> {
        match s {
            "streaming" => Ok(FileType::Streaming),
            "full_reload" => Ok(FileType::FullReload),
            "ddl" => Ok(FileType::Ddl),
            other => Err(CdcError::fatal(format!("unknown file_type '{other}'"))),
        }
    }

    /// Whether records of this type participate in the per-table
    /// end-LSN monotonicity invariant.
    pub fn is_lsn_bearing(&self) -> bool {
        matches!(self, FileType::Streaming | FileType::FullReload)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `file_log` registry table.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub table: TableId,
    pub batch_timestamp: DateTime<Utc>,
    pub file_path: String,
    pub file_type: FileType,
    pub end_lsn: Lsn,
    pub row_count: i64,
    pub has_ddl: bool,
    pub content_hash: Option<String>,
}

/// Per-table lifecycle mode.
///
/// ```text
/// PendingReload --initial export completes--> Streaming
/// Streaming --START marker--> Reloading --END marker--> Streaming
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    PendingReload,
    Streaming,
    Reloading,
}

impl TableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableMode::PendingReload => "PENDING_RELOAD",
            TableMode::Streaming => "STREAMING",
            TableMode::Reloading => "RELOADING",
        }
    }

    pub fn parse(s: &str) -> CdcResult<Self> {
        match s {
            "PENDING_RELOAD" => Ok(TableMode::PendingReload),
            "STREAMING" => Ok(TableMode::Streaming),
            "RELOADING" => Ok(TableMode::Reloading),
            other => Err(CdcError::fatal(format!("unknown table mode '{other}'"))),
        }
    }

    /// Static transition table. Illegal transitions are invariant violations
    /// and must fail loudly at the call site.
    pub fn can_transition(&self, to: TableMode) -> bool {
        matches!(
            (self, to),
            (TableMode::PendingReload, TableMode::Streaming)
                | (TableMode::Streaming, TableMode::Reloading)
                | (TableMode::Reloading, TableMode::Streaming)
        )
    }
}

impl fmt::Display for TableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `table_state` registry table.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: TableId,
    pub mode: TableMode,
    pub last_streaming_lsn: Option<Lsn>,
    pub reload_export_id: Option<Uuid>,
    pub reload_start_lsn: Option<Lsn>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    Active,
    Completed,
    Failed,
}

impl ReloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadStatus::Active => "ACTIVE",
            ReloadStatus::Completed => "COMPLETED",
            ReloadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> CdcResult<Self> {
        match s {
            "ACTIVE" => Ok(ReloadStatus::Active),
            "COMPLETED" => Ok(ReloadStatus::Completed),
            "FAILED" => Ok(ReloadStatus::Failed),
            other => Err(CdcError::fatal(format!("unknown reload status '{other}'"))),
        }
    }
}

/// One row of the `reload_operations` registry table. At most one Active
/// operation may exist per table; the registry enforces this with a partial
/// unique index.
#[derive(Debug, Clone)]
pub struct ReloadOperation {
    pub export_id: Uuid,
    pub table: TableId,
    pub start_marker_lsn: Lsn,
    pub end_marker_lsn: Option<Lsn>,
    pub status: ReloadStatus,
    pub created_at: DateTime<Utc>,
}

/// What happens to changes arriving for a table while it is reloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaStrategy {
    /// Drop deltas; record count and LSN range only.
    Discard,
    /// Write accumulated deltas as an auxiliary streaming batch after the
    /// reload completes, with `end_lsn` equal to the END marker LSN.
    Apply,
    /// Discard, but reconcile the count against the reload window for
    /// monitoring.
    Validate,
}

impl Default for DeltaStrategy {
    fn default() -> Self {
        DeltaStrategy::Discard
    }
}
