//! Reload coordination
//!
//! Reload markers ride the WAL itself, so every component observes them at
//! one definite LSN; that position is the only synchronization primitive the
//! protocol needs. On START the coordinator seals the table's streaming
//! history just short of the marker, opens a registry operation, and hands an
//! export job to the worker pool. While the reload runs, the dispatcher
//! diverts the table's changes into a delta buffer; on END the accumulated
//! deltas meet the configured strategy and the table streams again.
//!
//! Mismatched, duplicate, or premature markers never change state; they are
//! logged and dropped.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::batch::FlushControl;
use crate::change_buffer::{ChangeBufferSet, TableBatchSnapshot};
use crate::config::ReloadCoordinationConfig;
use crate::errors::{CdcError, CdcResult};
use crate::export::{ExportDispatch, ExportJob, ExportKind, ExportResult};
use crate::lsn::Lsn;
use crate::model::{DeltaStrategy, MarkerAction, ReloadMarker, TableId, TableMode};
use crate::registry::RegistryStore;
use crate::writer::BatchSink;

/// Marker consumption capability; the dispatcher drives this synchronously
/// so marker handling stays exactly ordered with the surrounding changes.
#[async_trait::async_trait]
pub trait MarkerObserver: Send + Sync {
    async fn handle_marker(&self, marker: ReloadMarker) -> CdcResult<()>;
}

pub struct ReloadCoordinator {
    registry: Arc<dyn RegistryStore>,
    buffers: Arc<ChangeBufferSet>,
    sink: Arc<dyn BatchSink>,
    flush: Arc<dyn FlushControl>,
    exports: Arc<dyn ExportDispatch>,
    config: ReloadCoordinationConfig,
    /// Failed attempts per table, bounded by `max_retries`.
    retries: Mutex<HashMap<TableId, u32>>,
    /// Cleared during shutdown: in-flight marker actions finish, new ones
    /// are dropped.
    accepting: AtomicBool,
}

impl ReloadCoordinator {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        buffers: Arc<ChangeBufferSet>,
        sink: Arc<dyn BatchSink>,
        flush: Arc<dyn FlushControl>,
        exports: Arc<dyn ExportDispatch>,
        config: ReloadCoordinationConfig,
    ) -> Self {
        Self {
            registry,
            buffers,
            sink,
            flush,
            exports,
            config,
            retries: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop reacting to new markers; part of graceful shutdown.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    #[instrument(skip(self, marker), fields(table = %marker.table, export_id = %marker.export_id, lsn = %marker.lsn))]
    async fn handle_start(&self, marker: ReloadMarker) -> CdcResult<()> {
        match self.registry.table_mode(&marker.table) {
            Some(TableMode::Streaming) => {}
            Some(TableMode::Reloading) => {
                warn!("START marker for a table already reloading, ignoring");
                return Ok(());
            }
            Some(TableMode::PendingReload) => {
                warn!("START marker for a table awaiting its initial export, ignoring");
                return Ok(());
            }
            None => {
                warn!("START marker for an unknown table, ignoring");
                return Ok(());
            }
        }

        // Seal streamed history strictly before the marker. The buffer holds
        // only commits below the marker LSN at this point because marker
        // handling is ordered within the dispatch loop.
        self.flush.flush_table(&marker.table).await?;

        match self
            .registry
            .mark_reload_start(&marker.table, marker.export_id, marker.lsn)
            .await
        {
            Ok(()) => {}
            Err(CdcError::ReloadAlreadyActive { .. }) => {
                warn!("reload operation raced an existing one, ignoring marker");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.exports
            .dispatch(ExportJob {
                table: marker.table.clone(),
                export_id: marker.export_id,
                kind: ExportKind::Reload {
                    anchor_lsn: marker.lsn,
                },
                snapshot_bound: None,
            })
            .await?;
        info!("reload export dispatched");
        Ok(())
    }

    #[instrument(skip(self, marker), fields(table = %marker.table, export_id = %marker.export_id, lsn = %marker.lsn))]
    async fn handle_end(&self, marker: ReloadMarker) -> CdcResult<()> {
        let Some(state) = self.registry.table_state(&marker.table) else {
            warn!("END marker for an unknown table, ignoring");
            return Ok(());
        };
        if state.mode != TableMode::Reloading {
            warn!("duplicate or stray END marker, ignoring");
            return Ok(());
        }
        if state.reload_export_id != Some(marker.export_id) {
            warn!(
                active = ?state.reload_export_id,
                "END marker export id does not match the active operation, ignoring"
            );
            return Ok(());
        }
        let anchor = state.reload_start_lsn.unwrap_or(Lsn::INVALID);
        if !self
            .registry
            .full_reload_registered(&marker.table, anchor)
            .await?
        {
            warn!("END marker observed before the export registered, ignoring");
            return Ok(());
        }

        self.registry
            .mark_reload_end(marker.export_id, marker.lsn)
            .await?;
        self.retries.lock().expect("retries poisoned").remove(&marker.table);
        self.apply_delta_policy(&marker.table, marker.lsn).await?;
        info!(rows_exported = ?marker.rows_exported, "reload completed, table streaming again");
        Ok(())
    }

    /// Resolve the delta buffer accumulated during the reload window.
    async fn apply_delta_policy(&self, table: &TableId, end_marker_lsn: Lsn) -> CdcResult<()> {
        let Some(delta) = self.buffers.take_delta(table) else {
            return Ok(());
        };

        match self.config.delta_strategy {
            DeltaStrategy::Discard => {
                info!(
                    table = %table,
                    rows = delta.row_count,
                    first_lsn = %delta.first_lsn,
                    last_lsn = %delta.last_lsn,
                    "discarded reload-window deltas"
                );
            }
            DeltaStrategy::Validate => {
                // Counts only; an external monitor compares this against the
                // source's change volume for the window.
                info!(
                    table = %table,
                    rows = delta.row_count,
                    first_lsn = %delta.first_lsn,
                    last_lsn = %delta.last_lsn,
                    "reload-window delta reconciliation"
                );
            }
            DeltaStrategy::Apply => {
                if delta.changes.is_empty() {
                    return Ok(());
                }
                let snapshot = TableBatchSnapshot {
                    table: delta.table,
                    header: delta.header,
                    changes: delta.changes,
                    ddl_events: Vec::new(),
                    bytes_estimate: 0,
                    end_lsn: end_marker_lsn,
                };
                let written = self.sink.write_streaming(&snapshot, Utc::now()).await?;
                let record = written.to_record(end_marker_lsn);
                if let Err(e) = self.registry.register(&record).await {
                    self.sink.discard(&written.directory);
                    return Err(e);
                }
                info!(table = %table, rows = record.row_count, "applied reload-window deltas");
            }
        }
        Ok(())
    }

    /// Worker completion feedback. Successes need no action here (initial
    /// exports flip their table in the worker; reload completion arrives
    /// in-band as an END marker). Failures drive the retry/abandon policy.
    pub async fn handle_export_result(&self, result: ExportResult) -> CdcResult<()> {
        let error = match result.outcome {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        let attempts = {
            let mut retries = self.retries.lock().expect("retries poisoned");
            let entry = retries.entry(result.table.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if !result.was_reload {
            // Initial export; the table stays PendingReload and visible in
            // the registry until an attempt succeeds.
            if attempts <= self.config.max_retries {
                warn!(
                    table = %result.table,
                    attempts,
                    "initial export failed, retrying: {error}"
                );
                self.exports
                    .dispatch(ExportJob {
                        table: result.table,
                        export_id: Uuid::new_v4(),
                        kind: ExportKind::Initial { snapshot: None },
                        snapshot_bound: None,
                    })
                    .await?;
            } else {
                warn!(
                    table = %result.table,
                    "initial export failed {attempts} times, leaving table in PendingReload: {error}"
                );
            }
            return Ok(());
        }

        let Some(state) = self.registry.table_state(&result.table) else {
            return Ok(());
        };
        if state.mode != TableMode::Reloading {
            return Ok(());
        }
        let anchor = state.reload_start_lsn.unwrap_or(Lsn::INVALID);

        if attempts <= self.config.max_retries {
            let new_export_id = Uuid::new_v4();
            warn!(
                table = %result.table,
                attempts,
                %new_export_id,
                "reload export failed, retrying: {error}"
            );
            self.registry
                .retry_reload(&result.table, new_export_id, anchor)
                .await?;
            self.exports
                .dispatch(ExportJob {
                    table: result.table,
                    export_id: new_export_id,
                    kind: ExportKind::Reload { anchor_lsn: anchor },
                    snapshot_bound: None,
                })
                .await?;
        } else {
            warn!(
                table = %result.table,
                "reload export failed {attempts} times, abandoning back to streaming: {error}"
            );
            self.abandon(&result.table).await?;
        }
        Ok(())
    }

    /// Fail reload operations that outlived the configured deadline, then
    /// retry with a fresh export id or abandon per the retry budget.
    pub async fn sweep_timeouts(&self) -> CdcResult<()> {
        let deadline = chrono::Duration::seconds(self.config.operation_timeout_seconds as i64);
        let now = Utc::now();

        for operation in self.registry.active_reloads().await? {
            if now.signed_duration_since(operation.created_at) <= deadline {
                continue;
            }
            warn!(
                table = %operation.table,
                export_id = %operation.export_id,
                "reload operation exceeded its deadline"
            );
            self.registry
                .failed_reload(operation.export_id, false)
                .await?;

            let attempts = {
                let mut retries = self.retries.lock().expect("retries poisoned");
                let entry = retries.entry(operation.table.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts <= self.config.max_retries {
                let new_export_id = Uuid::new_v4();
                self.registry
                    .retry_reload(&operation.table, new_export_id, operation.start_marker_lsn)
                    .await?;
                self.exports
                    .dispatch(ExportJob {
                        table: operation.table,
                        export_id: new_export_id,
                        kind: ExportKind::Reload {
                            anchor_lsn: operation.start_marker_lsn,
                        },
                        snapshot_bound: None,
                    })
                    .await?;
            } else {
                self.abandon(&operation.table).await?;
            }
        }
        Ok(())
    }

    /// Give up on reloading: drop the delta buffer and return the table to
    /// Streaming.
    async fn abandon(&self, table: &TableId) -> CdcResult<()> {
        if let Some(delta) = self.buffers.take_delta(table) {
            warn!(
                table = %table,
                rows = delta.row_count,
                "dropping deltas of an abandoned reload"
            );
        }
        self.retries.lock().expect("retries poisoned").remove(table);
        self.registry.mark_streaming(table).await
    }
}

#[async_trait::async_trait]
impl MarkerObserver for ReloadCoordinator {
    async fn handle_marker(&self, marker: ReloadMarker) -> CdcResult<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            warn!(table = %marker.table, "shutting down, ignoring marker");
            return Ok(());
        }
        match marker.action {
            MarkerAction::ExportStart => self.handle_start(marker).await,
            MarkerAction::ExportEnd => self.handle_end(marker).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::model::{Change, ChangeKind, FileRecord, FileType, ReloadStatus};
    use crate::registry::testing::InMemoryRegistry;
    use crate::writer::FileWriter;

    fn users() -> TableId {
        TableId::new("public", "users")
    }

    fn marker(action: MarkerAction, export_id: Uuid, lsn: u64) -> ReloadMarker {
        ReloadMarker {
            action,
            export_id,
            table: users(),
            timestamp: Utc::now(),
            rows_exported: None,
            lsn: Lsn(lsn),
        }
    }

    #[derive(Default)]
    struct RecordingFlush {
        flushed: Mutex<Vec<TableId>>,
    }

    #[async_trait::async_trait]
    impl FlushControl for RecordingFlush {
        async fn flush_table(&self, table: &TableId) -> CdcResult<()> {
            self.flushed.lock().unwrap().push(table.clone());
            Ok(())
        }

        async fn flush_all(&self) -> CdcResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDispatch {
        jobs: Mutex<Vec<(TableId, Uuid, Option<Lsn>)>>,
    }

    #[async_trait::async_trait]
    impl ExportDispatch for RecordingDispatch {
        async fn dispatch(&self, job: ExportJob) -> CdcResult<()> {
            let anchor = match job.kind {
                ExportKind::Reload { anchor_lsn } => Some(anchor_lsn),
                ExportKind::Initial { .. } => None,
            };
            self.jobs.lock().unwrap().push((job.table, job.export_id, anchor));
            Ok(())
        }
    }

    struct Fixture {
        coordinator: ReloadCoordinator,
        registry: Arc<InMemoryRegistry>,
        buffers: Arc<ChangeBufferSet>,
        flush: Arc<RecordingFlush>,
        dispatch: Arc<RecordingDispatch>,
        _tmp: tempfile::TempDir,
    }

    fn fixture_with(strategy: DeltaStrategy, max_retries: u32) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::with_streaming_tables(&[users()]));
        let buffers = Arc::new(ChangeBufferSet::new(strategy));
        let sink = Arc::new(FileWriter::new(OutputConfig {
            base_path: tmp.path().to_path_buf(),
            ..OutputConfig::default()
        }));
        let flush = Arc::new(RecordingFlush::default());
        let dispatch = Arc::new(RecordingDispatch::default());
        let coordinator = ReloadCoordinator::new(
            registry.clone(),
            buffers.clone(),
            sink,
            flush.clone(),
            dispatch.clone(),
            ReloadCoordinationConfig {
                delta_strategy: strategy,
                max_retries,
                ..ReloadCoordinationConfig::default()
            },
        );
        Fixture {
            coordinator,
            registry,
            buffers,
            flush,
            dispatch,
            _tmp: tmp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DeltaStrategy::Discard, 1)
    }

    async fn register_export(registry: &InMemoryRegistry, anchor: Lsn) {
        registry
            .register(&FileRecord {
                table: users(),
                batch_timestamp: Utc::now(),
                file_path: format!("/data/public.users/x/{anchor}/full_reload.csv.gz"),
                file_type: FileType::FullReload,
                end_lsn: anchor,
                row_count: 3,
                has_ddl: false,
                content_hash: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_marker_flushes_and_dispatches() {
        let f = fixture();
        let export_id = Uuid::new_v4();

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();

        assert_eq!(f.flush.flushed.lock().unwrap().as_slice(), &[users()]);
        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Reloading));
        let jobs = f.dispatch.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0], (users(), export_id, Some(Lsn(0x100))));
    }

    #[tokio::test]
    async fn test_start_while_reloading_is_ignored() {
        let f = fixture();
        let first = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, first, 0x100))
            .await
            .unwrap();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, Uuid::new_v4(), 0x200))
            .await
            .unwrap();

        // still the first operation, no extra dispatch
        assert_eq!(f.dispatch.jobs.lock().unwrap().len(), 1);
        let state = f.registry.table_state(&users()).unwrap();
        assert_eq!(state.reload_export_id, Some(first));
    }

    #[tokio::test]
    async fn test_end_marker_completes_operation() {
        let f = fixture();
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();
        register_export(&f.registry, Lsn(0x100)).await;

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, export_id, 0x200))
            .await
            .unwrap();

        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Streaming));
        let ops = f.registry.reloads();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, ReloadStatus::Completed);
        assert_eq!(ops[0].end_marker_lsn, Some(Lsn(0x200)));
    }

    #[tokio::test]
    async fn test_duplicate_end_marker_is_ignored() {
        let f = fixture();
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();
        register_export(&f.registry, Lsn(0x100)).await;

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, export_id, 0x200))
            .await
            .unwrap();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, export_id, 0x300))
            .await
            .unwrap();

        let ops = f.registry.reloads();
        assert_eq!(ops.len(), 1);
        // the second END changed nothing
        assert_eq!(ops[0].end_marker_lsn, Some(Lsn(0x200)));
    }

    #[tokio::test]
    async fn test_mismatched_end_marker_is_ignored() {
        let f = fixture();
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();
        register_export(&f.registry, Lsn(0x100)).await;

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, Uuid::new_v4(), 0x200))
            .await
            .unwrap();

        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Reloading));
    }

    #[tokio::test]
    async fn test_end_before_export_registered_is_ignored() {
        let f = fixture();
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, export_id, 0x200))
            .await
            .unwrap();

        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Reloading));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_strategy_writes_delta_batch() {
        let f = fixture_with(DeltaStrategy::Apply, 1);
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();
        register_export(&f.registry, Lsn(0x100)).await;

        f.buffers.append_delta(
            &users(),
            &["id".to_string()],
            Change {
                kind: ChangeKind::Insert,
                lsn: Lsn(0x150),
                commit_time: Utc::now(),
                values: vec![Some("7".into())],
                old_values: None,
            },
        );

        f.coordinator
            .handle_marker(marker(MarkerAction::ExportEnd, export_id, 0x200))
            .await
            .unwrap();

        let files = f.registry.files();
        let delta = files
            .iter()
            .find(|r| r.file_type == FileType::Streaming)
            .expect("delta batch registered");
        assert_eq!(delta.end_lsn, Lsn(0x200));
        assert_eq!(delta.row_count, 1);
        assert!(std::path::Path::new(&delta.file_path).exists());
    }

    #[tokio::test]
    async fn test_reload_failure_retries_then_abandons() {
        let f = fixture_with(DeltaStrategy::Discard, 1);
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();

        // worker reports failure (it already marked the op failed)
        f.registry.failed_reload(export_id, false).await.unwrap();
        f.coordinator
            .handle_export_result(ExportResult {
                table: users(),
                export_id,
                was_reload: true,
                anchor_lsn: None,
                outcome: Err(CdcError::snapshot("gone")),
            })
            .await
            .unwrap();

        // one retry dispatched with a fresh id at the same anchor
        let retry_id = {
            let jobs = f.dispatch.jobs.lock().unwrap();
            assert_eq!(jobs.len(), 2);
            assert_ne!(jobs[1].1, export_id);
            assert_eq!(jobs[1].2, Some(Lsn(0x100)));
            jobs[1].1
        };
        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Reloading));

        // retry fails too: budget exhausted, table abandoned to Streaming
        f.registry.failed_reload(retry_id, false).await.unwrap();
        f.coordinator
            .handle_export_result(ExportResult {
                table: users(),
                export_id: retry_id,
                was_reload: true,
                anchor_lsn: None,
                outcome: Err(CdcError::snapshot("still gone")),
            })
            .await
            .unwrap();

        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Streaming));
        assert!(f.registry.reloads().iter().all(|op| op.status == ReloadStatus::Failed));
    }

    #[tokio::test]
    async fn test_timeout_sweep_retries_expired_operation() {
        let f = fixture();
        let export_id = Uuid::new_v4();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, export_id, 0x100))
            .await
            .unwrap();

        // backdate the operation past the deadline
        {
            let mut state = f.registry.state.lock().unwrap();
            state.reloads[0].created_at =
                Utc::now() - chrono::Duration::seconds(7200);
        }

        f.coordinator.sweep_timeouts().await.unwrap();

        let jobs = f.dispatch.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2, "replacement export dispatched");
        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Reloading));
        let state = f.registry.table_state(&users()).unwrap();
        assert_eq!(state.reload_export_id, Some(jobs[1].1));
    }

    #[tokio::test]
    async fn test_markers_ignored_after_stop_accepting() {
        let f = fixture();
        f.coordinator.stop_accepting();
        f.coordinator
            .handle_marker(marker(MarkerAction::ExportStart, Uuid::new_v4(), 0x100))
            .await
            .unwrap();
        assert_eq!(f.registry.table_mode(&users()), Some(TableMode::Streaming));
        assert!(f.dispatch.jobs.lock().unwrap().is_empty());
    }
}
