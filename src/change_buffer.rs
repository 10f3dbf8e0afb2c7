//! Per-table in-memory buffering of decoded changes
//!
//! The replication dispatcher appends committed changes here; the batch
//! controller drains them with an atomic snapshot-and-reset. Those are the
//! only two tasks touching the buffer, serialized through one mutex.
//!
//! A table's pending work is a list of segments. Appends go to the last
//! segment; when a Relation message pins a different column set than the
//! segment was started with, a new segment is opened so no CSV mixes column
//! sets. Changes for tables in Reloading mode bypass the segments and land in
//! a per-table delta buffer governed by the configured delta strategy.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{Change, DdlEvent, DeltaStrategy, TableId};

/// Fixed per-row overhead added to the serialized byte estimate.
const ROW_OVERHEAD_BYTES: u64 = 16;

/// One flushable unit: changes for one table under one pinned column header.
#[derive(Debug, Clone)]
pub struct TableBatchSnapshot {
    pub table: TableId,
    /// Column order pinned by the Relation message current when the segment
    /// was opened. Empty for DDL-only batches.
    pub header: Vec<String>,
    pub changes: Vec<Change>,
    pub ddl_events: Vec<DdlEvent>,
    pub bytes_estimate: u64,
    pub end_lsn: Lsn,
}

impl TableBatchSnapshot {
    pub fn row_count(&self) -> u64 {
        self.changes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.ddl_events.is_empty()
    }
}

/// Accumulated deltas for a table while it reloads.
#[derive(Debug, Clone)]
pub struct DeltaSnapshot {
    pub table: TableId,
    pub header: Vec<String>,
    /// Populated only under the `apply` strategy.
    pub changes: Vec<Change>,
    pub row_count: u64,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

#[derive(Debug)]
struct Segment {
    header: Vec<String>,
    changes: Vec<Change>,
    ddl_events: Vec<DdlEvent>,
    bytes_estimate: u64,
    max_lsn: Lsn,
}

impl Segment {
    fn new(header: Vec<String>) -> Self {
        Self {
            header,
            changes: Vec::new(),
            ddl_events: Vec::new(),
            bytes_estimate: 0,
            max_lsn: Lsn::INVALID,
        }
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.ddl_events.is_empty()
    }

    fn into_snapshot(self, table: TableId) -> TableBatchSnapshot {
        TableBatchSnapshot {
            table,
            header: self.header,
            changes: self.changes,
            ddl_events: self.ddl_events,
            bytes_estimate: self.bytes_estimate,
            end_lsn: self.max_lsn,
        }
    }
}

#[derive(Debug)]
struct TableEntry {
    segments: Vec<Segment>,
    rows: u64,
    bytes: u64,
}

impl TableEntry {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            rows: 0,
            bytes: 0,
        }
    }
}

#[derive(Debug)]
struct DeltaEntry {
    header: Vec<String>,
    changes: Vec<Change>,
    row_count: u64,
    first_lsn: Lsn,
    last_lsn: Lsn,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableId, TableEntry>,
    deltas: HashMap<TableId, DeltaEntry>,
}

/// Shared buffer keyed by table, with size and row accounting.
#[derive(Debug)]
pub struct ChangeBufferSet {
    inner: Mutex<Inner>,
    delta_strategy: DeltaStrategy,
}

fn estimate_change_bytes(change: &Change) -> u64 {
    let count = |values: &Vec<Option<String>>| -> u64 {
        values
            .iter()
            .map(|v| v.as_ref().map(|s| s.len() as u64 + 1).unwrap_or(1))
            .sum()
    };
    let mut bytes = ROW_OVERHEAD_BYTES + count(&change.values);
    if let Some(old) = &change.old_values {
        bytes += count(old);
    }
    bytes
}

impl ChangeBufferSet {
    pub fn new(delta_strategy: DeltaStrategy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            delta_strategy,
        }
    }

    /// Append a committed change under the given pinned column header.
    /// Opens a new segment when the header differs from the current one.
    pub fn append_change(
        &self,
        table: &TableId,
        header: &[String],
        change: Change,
    ) -> CdcResult<()> {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        let entry = inner
            .tables
            .entry(table.clone())
            .or_insert_with(TableEntry::new);

        let needs_new_segment = match entry.segments.last() {
            Some(seg) => !seg.is_empty() && seg.header != header,
            None => true,
        };
        if needs_new_segment {
            entry.segments.push(Segment::new(header.to_vec()));
        }

        let seg = entry.segments.last_mut().expect("segment just ensured");
        if seg.header.is_empty() {
            // DDL-only segment adopts the header of the first row change.
            seg.header = header.to_vec();
        }
        if change.lsn < seg.max_lsn {
            return Err(CdcError::fatal(format!(
                "LSN went backwards in buffer for {table}: {} after {}",
                change.lsn, seg.max_lsn
            )));
        }

        let bytes = estimate_change_bytes(&change);
        seg.max_lsn = seg.max_lsn.max(change.lsn);
        seg.bytes_estimate += bytes;
        seg.changes.push(change);
        entry.rows += 1;
        entry.bytes += bytes;
        Ok(())
    }

    /// Append a captured DDL event to the table's current segment (or the
    /// global bucket's).
    pub fn append_ddl(&self, table: &TableId, event: DdlEvent) {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        let entry = inner
            .tables
            .entry(table.clone())
            .or_insert_with(TableEntry::new);
        if entry.segments.is_empty() {
            entry.segments.push(Segment::new(Vec::new()));
        }
        let seg = entry.segments.last_mut().expect("segment just ensured");
        seg.max_lsn = seg.max_lsn.max(event.lsn);
        seg.bytes_estimate += event.command_text.len() as u64;
        entry.bytes += event.command_text.len() as u64;
        seg.ddl_events.push(event);
    }

    /// Record a change for a table that is currently reloading.
    pub fn append_delta(&self, table: &TableId, header: &[String], change: Change) {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        let keep_rows = self.delta_strategy == DeltaStrategy::Apply;
        let entry = inner
            .deltas
            .entry(table.clone())
            .or_insert_with(|| DeltaEntry {
                header: header.to_vec(),
                changes: Vec::new(),
                row_count: 0,
                first_lsn: change.lsn,
                last_lsn: change.lsn,
            });
        entry.row_count += 1;
        entry.last_lsn = entry.last_lsn.max(change.lsn);
        if keep_rows {
            entry.header = header.to_vec();
            entry.changes.push(change);
        }
    }

    /// Atomically take every non-empty buffer whose table passes the filter,
    /// leaving the rest in place. Segments for one table come out in
    /// creation order, so their LSN ranges are strictly ordered.
    pub fn snapshot_and_reset<F>(&self, ready: F) -> Vec<TableBatchSnapshot>
    where
        F: Fn(&TableId) -> bool,
    {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        let mut out = Vec::new();
        for (table, entry) in inner.tables.iter_mut() {
            if !ready(table) {
                continue;
            }
            for seg in entry.segments.drain(..) {
                if !seg.is_empty() {
                    out.push(seg.into_snapshot(table.clone()));
                }
            }
            entry.rows = 0;
            entry.bytes = 0;
        }
        out.sort_by(|a, b| (&a.table, a.end_lsn).cmp(&(&b.table, b.end_lsn)));
        out
    }

    /// Put snapshots back at the front of their tables' segment lists after
    /// a failed write, preserving their relative order, so the next cycle
    /// retries them ahead of anything buffered since.
    pub fn restore_front(&self, snapshots: Vec<TableBatchSnapshot>) {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        for snapshot in snapshots.into_iter().rev() {
            let entry = inner
                .tables
                .entry(snapshot.table.clone())
                .or_insert_with(TableEntry::new);
            entry.rows += snapshot.changes.len() as u64;
            entry.bytes += snapshot.bytes_estimate;
            entry.segments.insert(
                0,
                Segment {
                    header: snapshot.header,
                    changes: snapshot.changes,
                    ddl_events: snapshot.ddl_events,
                    bytes_estimate: snapshot.bytes_estimate,
                    max_lsn: snapshot.end_lsn,
                },
            );
        }
    }

    /// Lowest LSN held by each unflushed segment, plus delta buffers when
    /// they must survive (apply strategy). The confirmed flush position may
    /// never move past any of these.
    pub fn pending_low_watermarks(&self, include_deltas: bool) -> Vec<Lsn> {
        let inner = self.inner.lock().expect("change buffer poisoned");
        let mut out = Vec::new();
        for entry in inner.tables.values() {
            for seg in &entry.segments {
                let change_low = seg.changes.first().map(|c| c.lsn);
                let ddl_low = seg.ddl_events.first().map(|d| d.lsn);
                match (change_low, ddl_low) {
                    (Some(a), Some(b)) => out.push(a.min(b)),
                    (Some(a), None) => out.push(a),
                    (None, Some(b)) => out.push(b),
                    (None, None) => {}
                }
            }
        }
        if include_deltas {
            out.extend(inner.deltas.values().map(|d| d.first_lsn));
        }
        out
    }

    /// Take only one table's pending segments, for the forced final flush
    /// ahead of a reload.
    pub fn snapshot_table(&self, table: &TableId) -> Vec<TableBatchSnapshot> {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        let Some(entry) = inner.tables.get_mut(table) else {
            return Vec::new();
        };
        entry.rows = 0;
        entry.bytes = 0;
        entry
            .segments
            .drain(..)
            .filter(|s| !s.is_empty())
            .map(|s| s.into_snapshot(table.clone()))
            .collect()
    }

    /// Take the accumulated deltas for a table, if any.
    pub fn take_delta(&self, table: &TableId) -> Option<DeltaSnapshot> {
        let mut inner = self.inner.lock().expect("change buffer poisoned");
        inner.deltas.remove(table).map(|d| DeltaSnapshot {
            table: table.clone(),
            header: d.header,
            changes: d.changes,
            row_count: d.row_count,
            first_lsn: d.first_lsn,
            last_lsn: d.last_lsn,
        })
    }

    /// Whether any table's pending rows or bytes exceed the batch limits.
    pub fn threshold_exceeded(&self, max_bytes: u64, max_rows: u64) -> bool {
        let inner = self.inner.lock().expect("change buffer poisoned");
        inner
            .tables
            .values()
            .any(|e| e.rows >= max_rows || e.bytes >= max_bytes)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("change buffer poisoned");
        inner.tables.values().all(|e| e.segments.iter().all(Segment::is_empty))
    }
}
