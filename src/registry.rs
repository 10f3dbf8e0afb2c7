//! Transactional file registry
//!
//! The registry lives in a dedicated schema in the source database, excluded
//! from the replication publication so its own writes never come back through
//! the stream. It is the sole writer of `file_log`, `table_state`, and
//! `reload_operations`, and keeps an in-memory mirror of table state that is
//! refreshed by every transaction so hot-path mode checks never hit the
//! database.
//!
//! Uniqueness and monotonicity are enforced twice: checked inside each
//! transaction while the state row is locked, and backed by database
//! constraints (primary keys, the partial unique index on active reloads).

use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, NoTls, Row, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{
    FileRecord, FileType, ReloadOperation, ReloadStatus, TableId, TableMode, TableState,
};

/// The registry surface the pipeline components depend on. The batch
/// controller, reload coordinator, and export pool reference each other only
/// through this and the shared change buffer.
#[async_trait::async_trait]
pub trait RegistryStore: Send + Sync {
    fn table_mode(&self, table: &TableId) -> Option<TableMode>;
    fn table_state(&self, table: &TableId) -> Option<TableState>;
    fn table_states(&self) -> Vec<TableState>;
    async fn register(&self, record: &FileRecord) -> CdcResult<()>;
    async fn ensure_table_state(&self, table: &TableId) -> CdcResult<()>;
    async fn mark_streaming(&self, table: &TableId) -> CdcResult<()>;
    async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()>;
    async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> CdcResult<()>;
    async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> CdcResult<()>;
    /// Open a replacement operation for a table whose previous attempt
    /// failed while it stayed in Reloading.
    async fn retry_reload(
        &self,
        table: &TableId,
        new_export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()>;
    async fn active_reloads(&self) -> CdcResult<Vec<ReloadOperation>>;
    async fn full_reload_registered(&self, table: &TableId, anchor: Lsn) -> CdcResult<bool>;
}

pub struct Registry {
    client: tokio::sync::Mutex<Client>,
    schema: String,
    cache: RwLock<HashMap<TableId, TableState>>,
}

/// Monotonicity rule for streaming/full-reload registrations: a new record
/// must advance the table's end LSN strictly.
fn check_monotonic(table: &TableId, last: Option<Lsn>, attempted: Lsn) -> CdcResult<()> {
    match last {
        Some(current) if attempted <= current => Err(CdcError::NonMonotonicLsn {
            table: table.to_string(),
            current: current.to_string(),
            attempted: attempted.to_string(),
        }),
        _ => Ok(()),
    }
}

fn table_state_from_row(row: &Row) -> CdcResult<TableState> {
    let mode: String = row.try_get("mode")?;
    Ok(TableState {
        table: TableId::new(
            row.try_get::<_, String>("schema_name")?,
            row.try_get::<_, String>("table_name")?,
        ),
        mode: TableMode::parse(&mode)?,
        last_streaming_lsn: row
            .try_get::<_, Option<PgLsn>>("last_streaming_lsn")?
            .map(Lsn::from),
        reload_export_id: row.try_get("reload_export_id")?,
        reload_start_lsn: row
            .try_get::<_, Option<PgLsn>>("reload_start_lsn")?
            .map(Lsn::from),
        updated_at: row.try_get("updated_at")?,
    })
}

fn reload_operation_from_row(row: &Row) -> CdcResult<ReloadOperation> {
    let status: String = row.try_get("status")?;
    Ok(ReloadOperation {
        export_id: row.try_get("export_id")?,
        table: TableId::new(
            row.try_get::<_, String>("schema_name")?,
            row.try_get::<_, String>("table_name")?,
        ),
        start_marker_lsn: Lsn::from(row.try_get::<_, PgLsn>("start_marker_lsn")?),
        end_marker_lsn: row
            .try_get::<_, Option<PgLsn>>("end_marker_lsn")?
            .map(Lsn::from),
        status: ReloadStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn file_record_from_row(row: &Row) -> CdcResult<FileRecord> {
    let file_type: String = row.try_get("file_type")?;
    Ok(FileRecord {
        table: TableId::new(
            row.try_get::<_, String>("schema_name")?,
            row.try_get::<_, String>("table_name")?,
        ),
        batch_timestamp: row.try_get("batch_timestamp")?,
        file_path: row.try_get("file_path")?,
        file_type: FileType::parse(&file_type)?,
        end_lsn: Lsn::from(row.try_get::<_, PgLsn>("end_lsn")?),
        row_count: row.try_get("row_count")?,
        has_ddl: row.try_get("has_ddl")?,
        content_hash: row.try_get("content_hash")?,
    })
}

/// DDL for the registry namespace. Idempotent.
fn schema_sql(schema: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.file_log (
    id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    schema_name text NOT NULL,
    table_name text NOT NULL,
    batch_timestamp timestamptz NOT NULL,
    file_path text NOT NULL UNIQUE,
    file_type text NOT NULL CHECK (file_type IN ('streaming', 'full_reload', 'ddl')),
    end_lsn pg_lsn NOT NULL,
    row_count bigint NOT NULL,
    has_ddl boolean NOT NULL DEFAULT false,
    content_hash text,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS file_log_table_lsn_idx
    ON {schema}.file_log (schema_name, table_name, end_lsn DESC);

CREATE TABLE IF NOT EXISTS {schema}.table_state (
    schema_name text NOT NULL,
    table_name text NOT NULL,
    mode text NOT NULL CHECK (mode IN ('PENDING_RELOAD', 'STREAMING', 'RELOADING')),
    last_streaming_lsn pg_lsn,
    reload_export_id uuid,
    reload_start_lsn pg_lsn,
    updated_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (schema_name, table_name)
);

CREATE TABLE IF NOT EXISTS {schema}.reload_operations (
    export_id uuid PRIMARY KEY,
    schema_name text NOT NULL,
    table_name text NOT NULL,
    start_marker_lsn pg_lsn NOT NULL,
    end_marker_lsn pg_lsn,
    status text NOT NULL CHECK (status IN ('ACTIVE', 'COMPLETED', 'FAILED')),
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS reload_operations_one_active
    ON {schema}.reload_operations (schema_name, table_name)
    WHERE status = 'ACTIVE';
"#
    )
}

impl Registry {
    /// Connect a dedicated session and make sure the bookkeeping tables
    /// exist.
    pub async fn connect(dsn: &str, schema: &str) -> CdcResult<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("registry connection closed: {e}");
            }
        });

        client.batch_execute(&schema_sql(schema)).await?;
        info!(schema, "registry schema ready");

        let registry = Self {
            client: tokio::sync::Mutex::new(client),
            schema: schema.to_string(),
            cache: RwLock::new(HashMap::new()),
        };
        registry.refresh_cache().await?;
        Ok(registry)
    }

    /// Reload the in-memory mirror of `table_state` from the database.
    pub async fn refresh_cache(&self) -> CdcResult<()> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("SELECT * FROM {}.table_state", self.schema),
                &[],
            )
            .await?;
        let mut map = HashMap::new();
        for row in &rows {
            let state = table_state_from_row(row)?;
            map.insert(state.table.clone(), state);
        }
        *self.cache.write().expect("cache poisoned") = map;
        Ok(())
    }

    fn cache_put(&self, state: TableState) {
        self.cache
            .write()
            .expect("cache poisoned")
            .insert(state.table.clone(), state);
    }

    /// Cached per-table state; refreshed by every registry transaction.
    pub fn table_state(&self, table: &TableId) -> Option<TableState> {
        self.cache.read().expect("cache poisoned").get(table).cloned()
    }

    pub fn table_states(&self) -> Vec<TableState> {
        self.cache.read().expect("cache poisoned").values().cloned().collect()
    }

    /// Cached mode lookup used by the replication dispatcher on every change.
    pub fn table_mode(&self, table: &TableId) -> Option<TableMode> {
        self.cache
            .read()
            .expect("cache poisoned")
            .get(table)
            .map(|s| s.mode)
    }

    async fn select_state_for_update(
        &self,
        tx: &Transaction<'_>,
        table: &TableId,
    ) -> CdcResult<Option<TableState>> {
        let rows = tx
            .query(
                &format!(
                    "SELECT * FROM {}.table_state \
                     WHERE schema_name = $1 AND table_name = $2 FOR UPDATE",
                    self.schema
                ),
                &[&table.schema, &table.name],
            )
            .await?;
        rows.first().map(table_state_from_row).transpose()
    }

    /// Register a produced file. For streaming and full-reload records this
    /// verifies strict end-LSN monotonicity against the locked state row and
    /// advances `last_streaming_lsn` in the same transaction.
    #[instrument(skip(self, record), fields(table = %record.table, file_type = %record.file_type, end_lsn = %record.end_lsn))]
    pub async fn register(&self, record: &FileRecord) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let mut refreshed = None;
        if record.file_type.is_lsn_bearing() {
            let state = self.select_state_for_update(&tx, &record.table).await?;
            let last = state.as_ref().and_then(|s| s.last_streaming_lsn);
            check_monotonic(&record.table, last, record.end_lsn)?;

            if let Some(mut state) = state {
                tx.execute(
                    &format!(
                        "UPDATE {}.table_state SET last_streaming_lsn = $3, updated_at = now() \
                         WHERE schema_name = $1 AND table_name = $2",
                        self.schema
                    ),
                    &[&record.table.schema, &record.table.name, &PgLsn::from(record.end_lsn)],
                )
                .await?;
                state.last_streaming_lsn = Some(record.end_lsn);
                state.updated_at = Utc::now();
                refreshed = Some(state);
            }
        }

        tx.execute(
            &format!(
                "INSERT INTO {}.file_log \
                 (schema_name, table_name, batch_timestamp, file_path, file_type, \
                  end_lsn, row_count, has_ddl, content_hash) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                self.schema
            ),
            &[
                &record.table.schema,
                &record.table.name,
                &record.batch_timestamp,
                &record.file_path,
                &record.file_type.as_str(),
                &PgLsn::from(record.end_lsn),
                &record.row_count,
                &record.has_ddl,
                &record.content_hash,
            ],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                CdcError::registry_conflict(format!(
                    "file {} is already registered",
                    record.file_path
                ))
            } else {
                CdcError::Database(e)
            }
        })?;

        tx.commit().await?;
        if let Some(state) = refreshed {
            self.cache_put(state);
        }
        debug!("registered file record");
        Ok(())
    }

    /// Insert a PendingReload state row for a newly discovered table.
    /// A no-op when the table is already known.
    pub async fn ensure_table_state(&self, table: &TableId) -> CdcResult<()> {
        let client = self.client.lock().await;
        let inserted = client
            .execute(
                &format!(
                    "INSERT INTO {}.table_state (schema_name, table_name, mode) \
                     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                    self.schema
                ),
                &[&table.schema, &table.name, &TableMode::PendingReload.as_str()],
            )
            .await?;
        drop(client);
        if inserted > 0 {
            self.cache_put(TableState {
                table: table.clone(),
                mode: TableMode::PendingReload,
                last_streaming_lsn: None,
                reload_export_id: None,
                reload_start_lsn: None,
                updated_at: Utc::now(),
            });
            info!(table = %table, "registered new table in PendingReload mode");
        }
        Ok(())
    }

    /// PendingReload -> Streaming once the table's initial export is
    /// registered.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn mark_streaming(&self, table: &TableId) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let state = self
            .select_state_for_update(&tx, table)
            .await?
            .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
        if !state.mode.can_transition(TableMode::Streaming) {
            return Err(CdcError::fatal(format!(
                "illegal transition {} -> STREAMING for {table}",
                state.mode
            )));
        }

        tx.execute(
            &format!(
                "UPDATE {}.table_state SET mode = $3, reload_export_id = NULL, \
                 reload_start_lsn = NULL, updated_at = now() \
                 WHERE schema_name = $1 AND table_name = $2",
                self.schema
            ),
            &[&table.schema, &table.name, &TableMode::Streaming.as_str()],
        )
        .await?;
        tx.commit().await?;

        self.cache_put(TableState {
            mode: TableMode::Streaming,
            reload_export_id: None,
            reload_start_lsn: None,
            updated_at: Utc::now(),
            ..state
        });
        Ok(())
    }

    /// Open a reload operation and move the table to Reloading.
    #[instrument(skip(self), fields(table = %table, export_id = %export_id, start_lsn = %start_lsn))]
    pub async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let state = self
            .select_state_for_update(&tx, table)
            .await?
            .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
        if !state.mode.can_transition(TableMode::Reloading) {
            return Err(CdcError::ReloadAlreadyActive {
                table: table.to_string(),
            });
        }

        tx.execute(
            &format!(
                "INSERT INTO {}.reload_operations \
                 (export_id, schema_name, table_name, start_marker_lsn, status) \
                 VALUES ($1, $2, $3, $4, $5)",
                self.schema
            ),
            &[
                &export_id,
                &table.schema,
                &table.name,
                &PgLsn::from(start_lsn),
                &ReloadStatus::Active.as_str(),
            ],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                CdcError::ReloadAlreadyActive {
                    table: table.to_string(),
                }
            } else {
                CdcError::Database(e)
            }
        })?;

        tx.execute(
            &format!(
                "UPDATE {}.table_state SET mode = $3, reload_export_id = $4, \
                 reload_start_lsn = $5, updated_at = now() \
                 WHERE schema_name = $1 AND table_name = $2",
                self.schema
            ),
            &[
                &table.schema,
                &table.name,
                &TableMode::Reloading.as_str(),
                &export_id,
                &PgLsn::from(start_lsn),
            ],
        )
        .await?;
        tx.commit().await?;

        self.cache_put(TableState {
            mode: TableMode::Reloading,
            reload_export_id: Some(export_id),
            reload_start_lsn: Some(start_lsn),
            updated_at: Utc::now(),
            ..state
        });
        info!("reload operation opened");
        Ok(())
    }

    /// Complete a reload operation and return its table to Streaming.
    #[instrument(skip(self), fields(export_id = %export_id, end_lsn = %end_lsn))]
    pub async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                &format!(
                    "UPDATE {}.reload_operations \
                     SET status = $2, end_marker_lsn = $3 \
                     WHERE export_id = $1 AND status = $4 \
                     RETURNING schema_name, table_name",
                    self.schema
                ),
                &[
                    &export_id,
                    &ReloadStatus::Completed.as_str(),
                    &PgLsn::from(end_lsn),
                    &ReloadStatus::Active.as_str(),
                ],
            )
            .await?;
        let row = rows.first().ok_or_else(|| {
            CdcError::registry_conflict(format!("no active reload operation {export_id}"))
        })?;
        let table = TableId::new(
            row.try_get::<_, String>(0)?,
            row.try_get::<_, String>(1)?,
        );

        let state = self
            .select_state_for_update(&tx, &table)
            .await?
            .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
        if !state.mode.can_transition(TableMode::Streaming) {
            return Err(CdcError::fatal(format!(
                "illegal transition {} -> STREAMING for {table}",
                state.mode
            )));
        }
        tx.execute(
            &format!(
                "UPDATE {}.table_state SET mode = $3, reload_export_id = NULL, \
                 reload_start_lsn = NULL, updated_at = now() \
                 WHERE schema_name = $1 AND table_name = $2",
                self.schema
            ),
            &[&table.schema, &table.name, &TableMode::Streaming.as_str()],
        )
        .await?;
        tx.commit().await?;

        self.cache_put(TableState {
            mode: TableMode::Streaming,
            reload_export_id: None,
            reload_start_lsn: None,
            updated_at: Utc::now(),
            ..state
        });
        info!(table = %table, "reload operation completed");
        Ok(())
    }

    /// Mark a reload operation Failed. The table either stays in Reloading
    /// so recovery can retry, or is abandoned back to Streaming.
    #[instrument(skip(self), fields(export_id = %export_id, abandon))]
    pub async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                &format!(
                    "UPDATE {}.reload_operations SET status = $2 \
                     WHERE export_id = $1 AND status = $3 \
                     RETURNING schema_name, table_name",
                    self.schema
                ),
                &[
                    &export_id,
                    &ReloadStatus::Failed.as_str(),
                    &ReloadStatus::Active.as_str(),
                ],
            )
            .await?;
        let Some(row) = rows.first() else {
            // Already resolved; nothing to do.
            tx.commit().await?;
            return Ok(());
        };
        let table = TableId::new(
            row.try_get::<_, String>(0)?,
            row.try_get::<_, String>(1)?,
        );

        if abandon {
            let state = self.select_state_for_update(&tx, &table).await?;
            tx.execute(
                &format!(
                    "UPDATE {}.table_state SET mode = $3, reload_export_id = NULL, \
                     reload_start_lsn = NULL, updated_at = now() \
                     WHERE schema_name = $1 AND table_name = $2",
                    self.schema
                ),
                &[&table.schema, &table.name, &TableMode::Streaming.as_str()],
            )
            .await?;
            if let Some(state) = state {
                self.cache_put(TableState {
                    mode: TableMode::Streaming,
                    reload_export_id: None,
                    reload_start_lsn: None,
                    updated_at: Utc::now(),
                    ..state
                });
            }
        }
        tx.commit().await?;
        warn!(table = %table, "reload operation marked failed");
        Ok(())
    }

    /// Replace a failed attempt: insert a fresh Active operation and point
    /// the (still Reloading) table state at the new export id.
    #[instrument(skip(self), fields(table = %table, %new_export_id))]
    pub async fn retry_reload(
        &self,
        table: &TableId,
        new_export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let state = self
            .select_state_for_update(&tx, table)
            .await?
            .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
        if state.mode != TableMode::Reloading {
            return Err(CdcError::fatal(format!(
                "retry for {table} but its mode is {}",
                state.mode
            )));
        }

        tx.execute(
            &format!(
                "INSERT INTO {}.reload_operations \
                 (export_id, schema_name, table_name, start_marker_lsn, status) \
                 VALUES ($1, $2, $3, $4, $5)",
                self.schema
            ),
            &[
                &new_export_id,
                &table.schema,
                &table.name,
                &PgLsn::from(start_lsn),
                &ReloadStatus::Active.as_str(),
            ],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                CdcError::ReloadAlreadyActive {
                    table: table.to_string(),
                }
            } else {
                CdcError::Database(e)
            }
        })?;
        tx.execute(
            &format!(
                "UPDATE {}.table_state SET reload_export_id = $3, reload_start_lsn = $4, \
                 updated_at = now() WHERE schema_name = $1 AND table_name = $2",
                self.schema
            ),
            &[
                &table.schema,
                &table.name,
                &new_export_id,
                &PgLsn::from(start_lsn),
            ],
        )
        .await?;
        tx.commit().await?;

        self.cache_put(TableState {
            reload_export_id: Some(new_export_id),
            reload_start_lsn: Some(start_lsn),
            updated_at: Utc::now(),
            ..state
        });
        Ok(())
    }

    /// Reload operations still marked Active, for recovery and timeouts.
    pub async fn active_reloads(&self) -> CdcResult<Vec<ReloadOperation>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT * FROM {}.reload_operations WHERE status = $1 ORDER BY created_at",
                    self.schema
                ),
                &[&ReloadStatus::Active.as_str()],
            )
            .await?;
        rows.iter().map(reload_operation_from_row).collect()
    }

    /// All registered file paths, newest first, for filesystem
    /// reconciliation.
    pub async fn file_records(&self) -> CdcResult<Vec<FileRecord>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("SELECT * FROM {}.file_log ORDER BY id", self.schema),
                &[],
            )
            .await?;
        rows.iter().map(file_record_from_row).collect()
    }

    /// Whether a full reload registered at exactly this anchor LSN exists
    /// for the table.
    pub async fn full_reload_registered(&self, table: &TableId, anchor: Lsn) -> CdcResult<bool> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT 1 FROM {}.file_log \
                     WHERE schema_name = $1 AND table_name = $2 \
                       AND file_type = 'full_reload' AND end_lsn = $3",
                    self.schema
                ),
                &[&table.schema, &table.name, &PgLsn::from(anchor)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Delete file_log rows older than the horizon that a later full reload
    /// has superseded. Returns the paths so the caller can delete the
    /// directories after the transaction commits.
    pub async fn cleanup_superseded(&self, older_than_days: u32) -> CdcResult<Vec<String>> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let rows = tx
            .query(
                &format!(
                    "DELETE FROM {s}.file_log f \
                     WHERE f.created_at < now() - ($1::bigint * interval '1 day') \
                       AND EXISTS (SELECT 1 FROM {s}.file_log r \
                                   WHERE r.schema_name = f.schema_name \
                                     AND r.table_name = f.table_name \
                                     AND r.file_type = 'full_reload' \
                                     AND r.end_lsn > f.end_lsn) \
                     RETURNING f.file_path",
                    s = self.schema
                ),
                &[&(older_than_days as i64)],
            )
            .await?;
        tx.commit().await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?)
    }

    /// Remove a file record that reconciliation found pointing at a missing
    /// or corrupt directory.
    pub async fn delete_file_record(&self, file_path: &str) -> CdcResult<u64> {
        let client = self.client.lock().await;
        Ok(client
            .execute(
                &format!("DELETE FROM {}.file_log WHERE file_path = $1", self.schema),
                &[&file_path],
            )
            .await?)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("schema", &self.schema).finish()
    }
}

#[async_trait::async_trait]
impl RegistryStore for Registry {
    fn table_mode(&self, table: &TableId) -> Option<TableMode> {
        Registry::table_mode(self, table)
    }

    fn table_state(&self, table: &TableId) -> Option<TableState> {
        Registry::table_state(self, table)
    }

    fn table_states(&self) -> Vec<TableState> {
        Registry::table_states(self)
    }

    async fn register(&self, record: &FileRecord) -> CdcResult<()> {
        Registry::register(self, record).await
    }

    async fn ensure_table_state(&self, table: &TableId) -> CdcResult<()> {
        Registry::ensure_table_state(self, table).await
    }

    async fn mark_streaming(&self, table: &TableId) -> CdcResult<()> {
        Registry::mark_streaming(self, table).await
    }

    async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()> {
        Registry::mark_reload_start(self, table, export_id, start_lsn).await
    }

    async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> CdcResult<()> {
        Registry::mark_reload_end(self, export_id, end_lsn).await
    }

    async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> CdcResult<()> {
        Registry::failed_reload(self, export_id, abandon).await
    }

    async fn retry_reload(
        &self,
        table: &TableId,
        new_export_id: Uuid,
        start_lsn: Lsn,
    ) -> CdcResult<()> {
        Registry::retry_reload(self, table, new_export_id, start_lsn).await
    }

    async fn active_reloads(&self) -> CdcResult<Vec<ReloadOperation>> {
        Registry::active_reloads(self).await
    }

    async fn full_reload_registered(&self, table: &TableId, anchor: Lsn) -> CdcResult<bool> {
        Registry::full_reload_registered(self, table, anchor).await
    }
}

/// In-memory stand-in mirroring the registry's transactional semantics, for
/// exercising the pipeline components without a database.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MemoryState {
        pub tables: HashMap<TableId, TableState>,
        pub files: Vec<FileRecord>,
        pub reloads: Vec<ReloadOperation>,
    }

    #[derive(Debug, Default)]
    pub struct InMemoryRegistry {
        pub state: Mutex<MemoryState>,
    }

    impl InMemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_streaming_tables(tables: &[TableId]) -> Self {
            let registry = Self::new();
            {
                let mut state = registry.state.lock().unwrap();
                for table in tables {
                    state.tables.insert(
                        table.clone(),
                        TableState {
                            table: table.clone(),
                            mode: TableMode::Streaming,
                            last_streaming_lsn: None,
                            reload_export_id: None,
                            reload_start_lsn: None,
                            updated_at: Utc::now(),
                        },
                    );
                }
            }
            registry
        }

        pub fn files(&self) -> Vec<FileRecord> {
            self.state.lock().unwrap().files.clone()
        }

        pub fn reloads(&self) -> Vec<ReloadOperation> {
            self.state.lock().unwrap().reloads.clone()
        }
    }

    #[async_trait::async_trait]
    impl RegistryStore for InMemoryRegistry {
        fn table_mode(&self, table: &TableId) -> Option<TableMode> {
            self.state.lock().unwrap().tables.get(table).map(|s| s.mode)
        }

        fn table_state(&self, table: &TableId) -> Option<TableState> {
            self.state.lock().unwrap().tables.get(table).cloned()
        }

        fn table_states(&self) -> Vec<TableState> {
            self.state.lock().unwrap().tables.values().cloned().collect()
        }

        async fn register(&self, record: &FileRecord) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.files.iter().any(|f| f.file_path == record.file_path) {
                return Err(CdcError::registry_conflict(format!(
                    "file {} is already registered",
                    record.file_path
                )));
            }
            if record.file_type.is_lsn_bearing() {
                let last = state
                    .tables
                    .get(&record.table)
                    .and_then(|s| s.last_streaming_lsn);
                check_monotonic(&record.table, last, record.end_lsn)?;
                if let Some(entry) = state.tables.get_mut(&record.table) {
                    entry.last_streaming_lsn = Some(record.end_lsn);
                }
            }
            state.files.push(record.clone());
            Ok(())
        }

        async fn ensure_table_state(&self, table: &TableId) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            state.tables.entry(table.clone()).or_insert_with(|| TableState {
                table: table.clone(),
                mode: TableMode::PendingReload,
                last_streaming_lsn: None,
                reload_export_id: None,
                reload_start_lsn: None,
                updated_at: Utc::now(),
            });
            Ok(())
        }

        async fn mark_streaming(&self, table: &TableId) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .tables
                .get_mut(table)
                .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
            if !entry.mode.can_transition(TableMode::Streaming) {
                return Err(CdcError::fatal(format!(
                    "illegal transition {} -> STREAMING for {table}",
                    entry.mode
                )));
            }
            entry.mode = TableMode::Streaming;
            entry.reload_export_id = None;
            entry.reload_start_lsn = None;
            Ok(())
        }

        async fn mark_reload_start(
            &self,
            table: &TableId,
            export_id: Uuid,
            start_lsn: Lsn,
        ) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            if state
                .reloads
                .iter()
                .any(|op| op.table == *table && op.status == ReloadStatus::Active)
            {
                return Err(CdcError::ReloadAlreadyActive {
                    table: table.to_string(),
                });
            }
            let entry = state
                .tables
                .get_mut(table)
                .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
            if !entry.mode.can_transition(TableMode::Reloading) {
                return Err(CdcError::ReloadAlreadyActive {
                    table: table.to_string(),
                });
            }
            entry.mode = TableMode::Reloading;
            entry.reload_export_id = Some(export_id);
            entry.reload_start_lsn = Some(start_lsn);
            state.reloads.push(ReloadOperation {
                export_id,
                table: table.clone(),
                start_marker_lsn: start_lsn,
                end_marker_lsn: None,
                status: ReloadStatus::Active,
                created_at: Utc::now(),
            });
            Ok(())
        }

        async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            let op = state
                .reloads
                .iter_mut()
                .find(|op| op.export_id == export_id && op.status == ReloadStatus::Active)
                .ok_or_else(|| {
                    CdcError::registry_conflict(format!("no active reload operation {export_id}"))
                })?;
            op.status = ReloadStatus::Completed;
            op.end_marker_lsn = Some(end_lsn);
            let table = op.table.clone();
            if let Some(entry) = state.tables.get_mut(&table) {
                entry.mode = TableMode::Streaming;
                entry.reload_export_id = None;
                entry.reload_start_lsn = None;
            }
            Ok(())
        }

        async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            let Some(op) = state
                .reloads
                .iter_mut()
                .find(|op| op.export_id == export_id && op.status == ReloadStatus::Active)
            else {
                return Ok(());
            };
            op.status = ReloadStatus::Failed;
            let table = op.table.clone();
            if abandon {
                if let Some(entry) = state.tables.get_mut(&table) {
                    entry.mode = TableMode::Streaming;
                    entry.reload_export_id = None;
                    entry.reload_start_lsn = None;
                }
            }
            Ok(())
        }

        async fn retry_reload(
            &self,
            table: &TableId,
            new_export_id: Uuid,
            start_lsn: Lsn,
        ) -> CdcResult<()> {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .tables
                .get_mut(table)
                .ok_or_else(|| CdcError::fatal(format!("no state row for {table}")))?;
            if entry.mode != TableMode::Reloading {
                return Err(CdcError::fatal(format!(
                    "retry for {table} but its mode is {}",
                    entry.mode
                )));
            }
            entry.reload_export_id = Some(new_export_id);
            entry.reload_start_lsn = Some(start_lsn);
            state.reloads.push(ReloadOperation {
                export_id: new_export_id,
                table: table.clone(),
                start_marker_lsn: start_lsn,
                end_marker_lsn: None,
                status: ReloadStatus::Active,
                created_at: Utc::now(),
            });
            Ok(())
        }

        async fn active_reloads(&self) -> CdcResult<Vec<ReloadOperation>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .reloads
                .iter()
                .filter(|op| op.status == ReloadStatus::Active)
                .cloned()
                .collect())
        }

        async fn full_reload_registered(&self, table: &TableId, anchor: Lsn) -> CdcResult<bool> {
            Ok(self.state.lock().unwrap().files.iter().any(|f| {
                f.table == *table && f.file_type == FileType::FullReload && f.end_lsn == anchor
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableId {
        TableId::new("public", "users")
    }

    #[test]
    fn test_monotonicity_rule() {
        assert!(check_monotonic(&users(), None, Lsn(10)).is_ok());
        assert!(check_monotonic(&users(), Some(Lsn(10)), Lsn(11)).is_ok());

        let equal = check_monotonic(&users(), Some(Lsn(10)), Lsn(10)).unwrap_err();
        assert!(matches!(equal, CdcError::NonMonotonicLsn { .. }));

        let backwards = check_monotonic(&users(), Some(Lsn(10)), Lsn(9)).unwrap_err();
        assert!(matches!(backwards, CdcError::NonMonotonicLsn { .. }));
    }

    #[test]
    fn test_schema_sql_shape() {
        let sql = schema_sql("cdc_registry");
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS cdc_registry"));
        assert!(sql.contains("cdc_registry.file_log"));
        assert!(sql.contains("cdc_registry.table_state"));
        assert!(sql.contains("cdc_registry.reload_operations"));
        // one active reload per table, enforced by a partial unique index
        assert!(sql.contains("WHERE status = 'ACTIVE'"));
        // LSN ordering index for downstream readers
        assert!(sql.contains("end_lsn DESC"));
        // idempotent: re-running must be a no-op
        assert_eq!(sql.matches("IF NOT EXISTS").count(), 6);
    }
}
