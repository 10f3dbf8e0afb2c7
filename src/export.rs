//! Export worker pool
//!
//! A fixed set of workers drains a job queue of full-table exports. Each job
//! runs on its own connection inside a read-only repeatable-read transaction,
//! bound either to the snapshot exported at slot creation (initial loads) or
//! to a fresh snapshot taken when the job starts (reloads and retries). The
//! table is pulled with COPY in CSV form and fed straight into the file
//! writer's full-reload pipeline.
//!
//! Concurrency is bounded by the worker count; excess jobs queue. Callers
//! submit jobs smallest-first so freshly streamable tables appear quickly.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_postgres::types::PgLsn;
use tokio_postgres::{IsolationLevel, NoTls, Transaction};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{
    ColumnInfo, ConstraintInfo, FileType, IndexInfo, MarkerAction, ReloadMarker, TableId,
    TableSchema,
};
use crate::registry::RegistryStore;
use crate::writer::BatchSink;

/// Why the export is running; decides anchoring and completion behavior.
#[derive(Debug)]
pub enum ExportKind {
    /// First load of a PendingReload table. With a slot-creation snapshot the
    /// anchor is the slot's consistent point; without one (resume) the worker
    /// anchors at its own snapshot position.
    Initial {
        snapshot: Option<SlotSnapshot>,
    },
    /// Marker-coordinated reload; the anchor is the START marker LSN.
    Reload { anchor_lsn: Lsn },
}

/// Snapshot exported by CREATE_REPLICATION_SLOT, shared by all initial
/// exports of a fresh init.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub name: String,
    pub consistent_point: Lsn,
}

/// One full-table export assignment.
#[derive(Debug)]
pub struct ExportJob {
    pub table: TableId,
    pub export_id: Uuid,
    pub kind: ExportKind,
    /// Fired once the worker's transaction has bound its snapshot; fresh
    /// init waits on these before starting to stream (the exported snapshot
    /// dies with the next command on the replication connection).
    pub snapshot_bound: Option<oneshot::Sender<()>>,
}

/// Outcome reported back to the coordinator.
#[derive(Debug)]
pub struct ExportResult {
    pub table: TableId,
    pub export_id: Uuid,
    pub was_reload: bool,
    pub anchor_lsn: Option<Lsn>,
    pub outcome: CdcResult<i64>,
}

/// Dispatch capability handed to the reload coordinator and startup.
#[async_trait::async_trait]
pub trait ExportDispatch: Send + Sync {
    async fn dispatch(&self, job: ExportJob) -> CdcResult<()>;
}

#[derive(Clone)]
pub struct ExportPoolHandle {
    job_tx: mpsc::Sender<ExportJob>,
}

#[async_trait::async_trait]
impl ExportDispatch for ExportPoolHandle {
    async fn dispatch(&self, job: ExportJob) -> CdcResult<()> {
        self.job_tx
            .send(job)
            .await
            .map_err(|_| CdcError::fatal("export pool is gone"))
    }
}

/// Shared worker context.
struct ExportContext {
    dsn: String,
    statement_timeout: Duration,
    marker_prefix: String,
    sink: Arc<dyn BatchSink>,
    registry: Arc<dyn RegistryStore>,
}

pub struct ExportWorkerPool;

impl ExportWorkerPool {
    /// Spawn the fixed-size pool. Jobs submitted through the returned handle
    /// run with bounded concurrency until shutdown flips or the handle is
    /// dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        dsn: String,
        max_workers: usize,
        statement_timeout: Duration,
        marker_prefix: String,
        sink: Arc<dyn BatchSink>,
        registry: Arc<dyn RegistryStore>,
        results_tx: mpsc::Sender<ExportResult>,
        shutdown: watch::Receiver<bool>,
    ) -> ExportPoolHandle {
        let (job_tx, job_rx) = mpsc::channel::<ExportJob>(64);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let context = Arc::new(ExportContext {
            dsn,
            statement_timeout,
            marker_prefix,
            sink,
            registry,
        });

        for worker_id in 0..max_workers {
            tokio::spawn(worker_loop(
                worker_id,
                context.clone(),
                job_rx.clone(),
                results_tx.clone(),
                shutdown.clone(),
            ));
        }
        info!(workers = max_workers, "export worker pool running");
        ExportPoolHandle { job_tx }
    }
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<ExportContext>,
    job_rx: Arc<Mutex<mpsc::Receiver<ExportJob>>>,
    results_tx: mpsc::Sender<ExportResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    enum Polled {
        Job(Option<ExportJob>),
        ShutdownTick { signal_lost: bool },
    }

    loop {
        let polled = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                job = rx.recv() => Polled::Job(job),
                changed = shutdown.changed() => Polled::ShutdownTick {
                    signal_lost: changed.is_err(),
                },
            }
        };
        let job = match polled {
            Polled::Job(Some(job)) => job,
            Polled::Job(None) => {
                debug!(worker_id, "export worker exiting");
                return;
            }
            Polled::ShutdownTick { signal_lost } => {
                if signal_lost || *shutdown.borrow() {
                    debug!(worker_id, "export worker exiting");
                    return;
                }
                continue;
            }
        };

        let table = job.table.clone();
        let export_id = job.export_id;
        let was_reload = matches!(job.kind, ExportKind::Reload { .. });

        let (anchor_lsn, outcome) = match run_export(&context, job).await {
            Ok((anchor, rows)) => (Some(anchor), Ok(rows)),
            Err(e) => {
                error!(table = %table, %export_id, "export failed: {e}");
                if was_reload {
                    // Leave the table in Reloading; the coordinator decides
                    // between retry and abandon.
                    if let Err(mark_err) = context.registry.failed_reload(export_id, false).await {
                        warn!("could not mark reload failed: {mark_err}");
                    }
                }
                (None, Err(e))
            }
        };

        let _ = results_tx
            .send(ExportResult {
                table,
                export_id,
                was_reload,
                anchor_lsn,
                outcome,
            })
            .await;
    }
}

/// Run one export end to end: snapshot, catalog, COPY, register, marker.
/// Returns the anchor LSN and exported row count.
#[instrument(skip(context, job), fields(table = %job.table, export_id = %job.export_id))]
async fn run_export(context: &ExportContext, job: ExportJob) -> CdcResult<(Lsn, i64)> {
    let (mut client, connection) = tokio_postgres::connect(&context.dsn, NoTls).await?;
    let connection_task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("export connection closed: {e}");
        }
    });

    client
        .batch_execute(&format!(
            "SET statement_timeout = {}",
            context.statement_timeout.as_millis()
        ))
        .await?;

    let tx = client
        .build_transaction()
        .isolation_level(IsolationLevel::RepeatableRead)
        .read_only(true)
        .start()
        .await?;

    // Bind the snapshot. Repeatable read pins its snapshot at the first
    // statement, so the anchor query below and the COPY see the same state.
    let anchor_lsn = match &job.kind {
        ExportKind::Initial {
            snapshot: Some(slot_snapshot),
        } => {
            tx.batch_execute(&format!(
                "SET TRANSACTION SNAPSHOT '{}'",
                slot_snapshot.name
            ))
            .await
            .map_err(|e| CdcError::snapshot(format!("cannot import slot snapshot: {e}")))?;
            slot_snapshot.consistent_point
        }
        ExportKind::Initial { snapshot: None } => {
            let row = tx
                .query_one("SELECT pg_current_wal_lsn()", &[])
                .await
                .map_err(|e| CdcError::snapshot(format!("cannot anchor snapshot: {e}")))?;
            Lsn::from(row.try_get::<_, PgLsn>(0)?)
        }
        ExportKind::Reload { anchor_lsn } => {
            // Pin the snapshot now; it covers at least everything up to the
            // marker the coordinator observed before dispatching.
            tx.batch_execute("SELECT 1")
                .await
                .map_err(|e| CdcError::snapshot(format!("cannot open snapshot: {e}")))?;
            *anchor_lsn
        }
    };
    if let Some(bound) = job.snapshot_bound {
        let _ = bound.send(());
    }

    let row_count: i64 = tx
        .query_one(
            &format!("SELECT count(*) FROM {}", job.table.qualified()),
            &[],
        )
        .await?
        .try_get(0)?;

    let mut schema = fetch_table_schema(&tx, &job.table).await?;
    schema.row_count = row_count;
    schema.exported_at = Utc::now();

    // Stream COPY chunks into the writer; the channel keeps memory bounded.
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(16);
    let sink = context.sink.clone();
    let write_task = tokio::spawn(async move {
        sink.write_full_reload(schema, chunk_rx, row_count, Utc::now())
            .await
    });

    let copy_result = async {
        let copy_stream = tx
            .copy_out(&format!(
                "COPY {} TO STDOUT (FORMAT csv, HEADER true)",
                job.table.qualified()
            ))
            .await?;
        futures::pin_mut!(copy_stream);
        while let Some(chunk) = copy_stream.next().await {
            let chunk = chunk?;
            if chunk_tx.send(chunk).await.is_err() {
                return Err(CdcError::fatal("full reload writer went away"));
            }
        }
        Ok::<(), CdcError>(())
    }
    .await;
    drop(chunk_tx);

    let written = write_task.await?;
    let written = match (copy_result, written) {
        (Ok(()), Ok(written)) => written,
        (Err(e), Ok(written)) => {
            context.sink.discard(&written.directory);
            return Err(e);
        }
        (_, Err(e)) => return Err(e),
    };

    let record = written.to_record(anchor_lsn);
    debug_assert_eq!(record.file_type, FileType::FullReload);
    if let Err(e) = context.registry.register(&record).await {
        match e {
            CdcError::NonMonotonicLsn { .. } | CdcError::RegistryConflict { .. } => {
                // A previous attempt already landed this export.
                warn!(table = %job.table, "export already registered, discarding duplicate");
                context.sink.discard(&written.directory);
            }
            other => {
                context.sink.discard(&written.directory);
                return Err(other);
            }
        }
    }

    tx.commit().await?;

    match job.kind {
        ExportKind::Initial { .. } => {
            context.registry.mark_streaming(&job.table).await?;
        }
        ExportKind::Reload { .. } => {
            // Completion is announced in-band so every observer sees it at
            // one definite LSN.
            let end_marker = ReloadMarker {
                action: MarkerAction::ExportEnd,
                export_id: job.export_id,
                table: job.table.clone(),
                timestamp: Utc::now(),
                rows_exported: Some(row_count as u64),
                lsn: Lsn::INVALID,
            };
            client
                .batch_execute(&end_marker.to_sql(&context.marker_prefix))
                .await?;
        }
    }

    info!(table = %job.table, rows = row_count, anchor = %anchor_lsn, "export complete");
    drop(client);
    connection_task.abort();
    Ok((anchor_lsn, row_count))
}

const COLUMNS_SQL: &str = "\
SELECT a.attname,
       pg_catalog.format_type(a.atttypid, a.atttypmod),
       NOT a.attnotnull,
       pg_catalog.pg_get_expr(d.adbin, d.adrelid),
       CASE WHEN a.atttypmod > 4 THEN a.atttypmod - 4 END,
       COALESCE(i.indisprimary, false)
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
LEFT JOIN pg_catalog.pg_index i
       ON i.indrelid = a.attrelid AND i.indisprimary AND a.attnum = ANY(i.indkey)
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

const INDEXES_SQL: &str = "\
SELECT indexname, indexdef
FROM pg_catalog.pg_indexes
WHERE schemaname = $1 AND tablename = $2
ORDER BY indexname";

const CONSTRAINTS_SQL: &str = "\
SELECT conname, contype::text, pg_catalog.pg_get_constraintdef(oid)
FROM pg_catalog.pg_constraint
WHERE conrelid = (quote_ident($1) || '.' || quote_ident($2))::regclass
ORDER BY conname";

fn constraint_type_name(code: &str) -> String {
    match code {
        "p" => "PRIMARY KEY".to_string(),
        "f" => "FOREIGN KEY".to_string(),
        "u" => "UNIQUE".to_string(),
        "c" => "CHECK".to_string(),
        "x" => "EXCLUSION".to_string(),
        other => other.to_string(),
    }
}

/// Build the schema descriptor from the source catalog at the transaction's
/// snapshot. `row_count` and `exported_at` are filled in by the caller.
async fn fetch_table_schema(tx: &Transaction<'_>, table: &TableId) -> CdcResult<TableSchema> {
    let column_rows = tx
        .query(COLUMNS_SQL, &[&table.schema, &table.name])
        .await?;
    if column_rows.is_empty() {
        return Err(CdcError::snapshot(format!(
            "table {table} not found in catalog"
        )));
    }
    let mut columns = Vec::with_capacity(column_rows.len());
    for row in &column_rows {
        columns.push(ColumnInfo {
            name: row.try_get(0)?,
            data_type: row.try_get(1)?,
            nullable: row.try_get(2)?,
            default: row.try_get(3)?,
            length: row.try_get(4)?,
            is_primary_key: row.try_get(5)?,
        });
    }

    let index_rows = tx.query(INDEXES_SQL, &[&table.schema, &table.name]).await?;
    let indexes = index_rows
        .iter()
        .map(|row| -> CdcResult<IndexInfo> {
            let definition: String = row.try_get(1)?;
            Ok(IndexInfo {
                name: row.try_get(0)?,
                is_unique: definition.starts_with("CREATE UNIQUE"),
                definition,
            })
        })
        .collect::<CdcResult<Vec<_>>>()?;

    let constraint_rows = tx
        .query(CONSTRAINTS_SQL, &[&table.schema, &table.name])
        .await?;
    let constraints = constraint_rows
        .iter()
        .map(|row| -> CdcResult<ConstraintInfo> {
            let code: String = row.try_get(1)?;
            Ok(ConstraintInfo {
                name: row.try_get(0)?,
                constraint_type: constraint_type_name(&code),
                definition: row.try_get(2)?,
            })
        })
        .collect::<CdcResult<Vec<_>>>()?;

    Ok(TableSchema {
        schema: table.schema.clone(),
        table: table.name.clone(),
        columns,
        indexes,
        constraints,
        row_count: 0,
        exported_at: Utc::now(),
    })
}
