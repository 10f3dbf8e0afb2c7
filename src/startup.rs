//! Startup and recovery
//!
//! Boot decides between fresh init (no slot: create it, install DDL capture,
//! discover tables, export everything) and resume (slot exists: reconcile the
//! registry against the filesystem, repair or retry partial work, continue
//! from the last safe position). Every reconciliation action is a no-op when
//! the state is already consistent, so recovery can run any number of times.

use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_postgres::{Client, NoTls};
use tracing::{info, instrument, warn};

use crate::config::TableFilterConfig;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{FileRecord, FileType, ReloadOperation, TableId, TableState};
use crate::registry::Registry;
use crate::writer::layout;

/// Unregistered directories younger than this are left alone; their writer
/// may still be between rename and registration.
const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

/// DDL capture: an event trigger records every DDL command into a table the
/// publication replicates, which is how DDL and reload markers reach the
/// stream in-band.
const DDL_CAPTURE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS public.ddl_history (
    id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    captured_at timestamptz NOT NULL DEFAULT now(),
    object_type text,
    schema_name text,
    object_name text,
    tag text NOT NULL,
    command_text text NOT NULL
);

CREATE OR REPLACE FUNCTION public.wal2csv_capture_ddl() RETURNS event_trigger
LANGUAGE plpgsql AS $fn$
DECLARE
    r record;
BEGIN
    FOR r IN SELECT * FROM pg_event_trigger_ddl_commands() LOOP
        INSERT INTO public.ddl_history (object_type, schema_name, object_name, tag, command_text)
        VALUES (
            r.object_type,
            r.schema_name,
            split_part(r.object_identity, '.', 2),
            r.command_tag,
            current_query()
        );
    END LOOP;
END
$fn$;

DO $do$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_event_trigger WHERE evtname = 'wal2csv_ddl_capture') THEN
        CREATE EVENT TRIGGER wal2csv_ddl_capture
            ON ddl_command_end
            EXECUTE FUNCTION public.wal2csv_capture_ddl();
    END IF;
END
$do$;
"#;

/// Plain SQL session for catalog work outside the replication protocol.
pub struct AdminClient {
    client: Client,
}

impl AdminClient {
    pub async fn connect(dsn: &str) -> CdcResult<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("admin connection closed: {e}");
            }
        });
        Ok(Self { client })
    }

    /// Install the DDL capture trigger; safe to run on every boot.
    pub async fn install_ddl_capture(&self) -> CdcResult<()> {
        self.client.batch_execute(DDL_CAPTURE_SQL).await?;
        info!("ddl capture trigger installed");
        Ok(())
    }

    /// Tables in the publication, narrowed by the configured schema filters
    /// and primary-key requirement.
    pub async fn target_tables(
        &self,
        publication: &str,
        filter: &TableFilterConfig,
    ) -> CdcResult<Vec<TableId>> {
        let rows = self
            .client
            .query(
                "SELECT schemaname, tablename FROM pg_catalog.pg_publication_tables \
                 WHERE pubname = $1 ORDER BY schemaname, tablename",
                &[&publication],
            )
            .await?;

        let mut tables = Vec::new();
        for row in &rows {
            let table = TableId::new(
                row.try_get::<_, String>(0)?,
                row.try_get::<_, String>(1)?,
            );
            if !filter.include_schemas.contains(&table.schema) {
                continue;
            }
            if filter.exclude_schemas.contains(&table.schema) {
                continue;
            }
            if filter.require_primary_key && !self.has_primary_key(&table).await? {
                warn!(table = %table, "skipping table without a primary key");
                continue;
            }
            tables.push(table);
        }
        Ok(tables)
    }

    async fn has_primary_key(&self, table: &TableId) -> CdcResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (\
                   SELECT 1 FROM pg_catalog.pg_index i \
                   JOIN pg_catalog.pg_class c ON c.oid = i.indrelid \
                   JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                   WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary)",
                &[&table.schema, &table.name],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    /// Size estimate used for smallest-first export scheduling.
    pub async fn relation_size(&self, table: &TableId) -> CdcResult<i64> {
        let row = self
            .client
            .query_one(
                "SELECT pg_catalog.pg_relation_size(\
                   (quote_ident($1) || '.' || quote_ident($2))::regclass)",
                &[&table.schema, &table.name],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    /// Operator escape hatch: drop the slot and truncate the registry for a
    /// clean re-initialization. Refuses while the slot is active.
    pub async fn drop_slot_and_reset(&self, slot: &str, registry_schema: &str) -> CdcResult<()> {
        let rows = self
            .client
            .query(
                "SELECT active FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await?;
        match rows.first() {
            None => info!(slot, "slot does not exist, nothing to drop"),
            Some(row) => {
                if row.try_get::<_, bool>(0)? {
                    return Err(CdcError::SlotInUse {
                        slot: slot.to_string(),
                    });
                }
                self.client
                    .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
                    .await?;
                info!(slot, "dropped replication slot");
            }
        }
        self.client
            .batch_execute(&format!(
                "TRUNCATE {s}.file_log, {s}.table_state, {s}.reload_operations",
                s = registry_schema
            ))
            .await?;
        info!("registry state truncated");
        Ok(())
    }
}

/// What reconciliation decided to do; applied in one pass afterwards.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Stale registry rows whose files are gone.
    pub delete_records: Vec<String>,
    /// Unregistered or corrupt directories to remove.
    pub remove_dirs: Vec<PathBuf>,
    /// Unregistered but intact streaming batches that can be re-registered
    /// with a recovered end LSN.
    pub reregister: Vec<FileRecord>,
    pub tmp_dirs_removed: usize,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.delete_records.is_empty()
            && self.remove_dirs.is_empty()
            && self.reregister.is_empty()
            && self.tmp_dirs_removed == 0
    }
}

fn dir_age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or(Duration::ZERO)
}

/// Compare the registry against the on-disk layout and plan the repairs.
#[instrument(skip_all, fields(base = %base.display()))]
pub fn plan_reconcile(base: &Path, records: &[FileRecord]) -> CdcResult<ReconcilePlan> {
    let mut plan = ReconcilePlan {
        tmp_dirs_removed: layout::remove_tmp_dirs(base)?,
        ..ReconcilePlan::default()
    };

    let registered_dirs: HashSet<PathBuf> = records
        .iter()
        .filter_map(|r| Path::new(&r.file_path).parent().map(Path::to_path_buf))
        .collect();

    for record in records {
        if !Path::new(&record.file_path).exists() {
            warn!(path = %record.file_path, "registered file missing on disk");
            plan.delete_records.push(record.file_path.clone());
        }
    }

    for (dir_name, _stamp, path) in layout::scan_batch_dirs(base)? {
        if registered_dirs.contains(&path) {
            continue;
        }
        if dir_age(&path) < ORPHAN_GRACE {
            continue;
        }

        let streaming = path.join(layout::STREAMING_FILE);
        if streaming.exists() {
            match layout::inspect_streaming_file(&streaming) {
                Ok(inspection) => {
                    if let (Some(end_lsn), Some(table)) =
                        (inspection.end_lsn, table_from_dir_name(&dir_name))
                    {
                        plan.reregister.push(FileRecord {
                            table,
                            batch_timestamp: Utc::now(),
                            file_path: streaming.display().to_string(),
                            file_type: FileType::Streaming,
                            end_lsn,
                            row_count: inspection.row_count,
                            has_ddl: path.join(layout::DDL_FILE).exists(),
                            content_hash: Some(inspection.content_hash),
                        });
                        continue;
                    }
                }
                Err(e) => {
                    warn!(dir = %path.display(), "unregistered batch unreadable: {e}");
                }
            }
        }
        // Full reloads carry no recoverable LSN; corrupt or empty
        // directories go too.
        plan.remove_dirs.push(path);
    }

    Ok(plan)
}

fn table_from_dir_name(dir_name: &str) -> Option<TableId> {
    match dir_name.split_once('.') {
        Some((schema, name)) => Some(TableId::new(schema, name)),
        None if dir_name == "_global" => Some(TableId::global_ddl_bucket()),
        None => None,
    }
}

/// Execute a reconcile plan against the live registry and filesystem.
pub async fn apply_reconcile(plan: ReconcilePlan, registry: &Registry) -> CdcResult<()> {
    if plan.is_noop() {
        info!("registry and filesystem already consistent");
        return Ok(());
    }
    info!(
        stale_records = plan.delete_records.len(),
        orphan_dirs = plan.remove_dirs.len(),
        recovered = plan.reregister.len(),
        tmp_removed = plan.tmp_dirs_removed,
        "applying recovery plan"
    );

    for path in &plan.delete_records {
        registry.delete_file_record(path).await?;
    }
    for record in &plan.reregister {
        match registry.register(record).await {
            Ok(()) => info!(path = %record.file_path, end_lsn = %record.end_lsn, "re-registered orphan batch"),
            Err(CdcError::NonMonotonicLsn { .. }) | Err(CdcError::RegistryConflict { .. }) => {
                // Already superseded by registered work; remove instead.
                if let Some(dir) = Path::new(&record.file_path).parent() {
                    layout::remove_batch_dir(dir);
                }
            }
            Err(e) => return Err(e),
        }
    }
    for dir in &plan.remove_dirs {
        layout::remove_batch_dir(dir);
    }
    registry.refresh_cache().await?;
    Ok(())
}

/// Check the Active reload operations against registered exports: intact
/// exports keep waiting for their END marker to replay, anything else is
/// retried from the same start marker LSN.
pub async fn reloads_needing_retry(
    registry: &Registry,
    records: &[FileRecord],
) -> CdcResult<Vec<ReloadOperation>> {
    let mut retries = Vec::new();
    for operation in registry.active_reloads().await? {
        let export = records.iter().find(|r| {
            r.table == operation.table
                && r.file_type == FileType::FullReload
                && r.end_lsn == operation.start_marker_lsn
        });
        match export {
            Some(record) => {
                let intact = Path::new(&record.file_path).exists()
                    && match layout::inspect_data_file(Path::new(&record.file_path), true) {
                        Ok(inspection) => {
                            record.content_hash.is_none()
                                || record.content_hash.as_deref()
                                    == Some(inspection.content_hash.as_str())
                        }
                        Err(_) => false,
                    };
                if intact {
                    info!(
                        table = %operation.table,
                        export_id = %operation.export_id,
                        "reload export intact; awaiting END marker replay"
                    );
                } else {
                    warn!(
                        table = %operation.table,
                        "reload export corrupt, scheduling re-export"
                    );
                    registry.delete_file_record(&record.file_path).await?;
                    if let Some(dir) = Path::new(&record.file_path).parent() {
                        layout::remove_batch_dir(dir);
                    }
                    retries.push(operation);
                }
            }
            None => {
                info!(
                    table = %operation.table,
                    export_id = %operation.export_id,
                    "interrupted reload export, restarting from its start marker"
                );
                retries.push(operation);
            }
        }
    }
    Ok(retries)
}

/// Resume position: the lowest per-table streamed LSN, never past the slot's
/// confirmed position. Anything buffered but unregistered at the crash sits
/// above the confirmed position, so starting at or below it replays exactly
/// the WAL whose batches never landed. The server clamps requests below the
/// confirmed position up to it.
pub fn compute_resume_lsn(states: &[TableState], confirmed_flush: Option<Lsn>) -> Lsn {
    let candidate = states
        .iter()
        .filter_map(|s| s.last_streaming_lsn)
        .min()
        .unwrap_or(Lsn::INVALID);
    match confirmed_flush {
        Some(confirmed) if candidate.is_valid() => candidate.min(confirmed),
        Some(confirmed) => confirmed,
        None => candidate,
    }
}
