//! Batch controller
//!
//! Single flush scheduler for the whole pipeline. A cycle triggers on the
//! wall-clock interval, when any per-table buffer crosses its size or row
//! limit, or on demand (reload coordination, shutdown). Each cycle snapshots
//! the ready buffers, materializes one batch directory per segment, registers
//! it, and only then lets the confirmed flush LSN advance.
//!
//! Tables that are not in Streaming mode are left buffered: PendingReload
//! tables flush once their initial export lands, Reloading tables divert to
//! delta buffers at the dispatcher.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::change_buffer::{ChangeBufferSet, TableBatchSnapshot};
use crate::config::BatchControlConfig;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{DeltaStrategy, TableId, TableMode};
use crate::registry::RegistryStore;
use crate::replication::client::ConfirmHandle;
use crate::writer::BatchSink;

/// Consecutive I/O failures tolerated before the controller escalates to a
/// fatal error.
const MAX_IO_ERROR_STREAK: u32 = 5;

/// On-demand flush capability exposed to the reload coordinator.
#[async_trait::async_trait]
pub trait FlushControl: Send + Sync {
    /// Flush one table's pending buffer as a final streaming batch and wait
    /// for its registration.
    async fn flush_table(&self, table: &TableId) -> CdcResult<()>;

    /// Run a full flush cycle and wait for it.
    async fn flush_all(&self) -> CdcResult<()>;
}

pub struct FlushRequest {
    table: Option<TableId>,
    reply: oneshot::Sender<CdcResult<()>>,
}

#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<FlushRequest>,
}

#[async_trait::async_trait]
impl FlushControl for FlushHandle {
    async fn flush_table(&self, table: &TableId) -> CdcResult<()> {
        self.request(Some(table.clone())).await
    }

    async fn flush_all(&self) -> CdcResult<()> {
        self.request(None).await
    }
}

impl FlushHandle {
    async fn request(&self, table: Option<TableId>) -> CdcResult<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(FlushRequest { table, reply })
            .await
            .map_err(|_| CdcError::fatal("batch controller is gone"))?;
        response
            .await
            .map_err(|_| CdcError::fatal("batch controller dropped a flush request"))?
    }
}

enum Wakeup {
    Tick,
    Threshold,
    Request(Option<FlushRequest>),
    Shutdown { signal_lost: bool },
}

pub struct BatchController {
    buffers: Arc<ChangeBufferSet>,
    registry: Arc<dyn RegistryStore>,
    sink: Arc<dyn BatchSink>,
    confirm: ConfirmHandle,
    config: BatchControlConfig,
    delta_strategy: DeltaStrategy,
    /// Highest LSN at which the stream had no unbuffered row data.
    safe_lsn: watch::Receiver<Lsn>,
    /// Poked by the dispatcher when a buffer may have crossed a limit.
    flush_notify: Arc<Notify>,
    request_rx: mpsc::Receiver<FlushRequest>,
    requests_closed: bool,
    shutdown: watch::Receiver<bool>,
    last_confirmed: Lsn,
    io_error_streak: u32,
}

impl BatchController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffers: Arc<ChangeBufferSet>,
        registry: Arc<dyn RegistryStore>,
        sink: Arc<dyn BatchSink>,
        confirm: ConfirmHandle,
        config: BatchControlConfig,
        delta_strategy: DeltaStrategy,
        safe_lsn: watch::Receiver<Lsn>,
        flush_notify: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, FlushHandle) {
        let (tx, request_rx) = mpsc::channel(16);
        (
            Self {
                buffers,
                registry,
                sink,
                confirm,
                config,
                delta_strategy,
                safe_lsn,
                flush_notify,
                request_rx,
                requests_closed: false,
                shutdown,
                last_confirmed: Lsn::INVALID,
                io_error_streak: 0,
            },
            FlushHandle { tx },
        )
    }

    /// Drive flush cycles until shutdown. On shutdown, one final cycle runs
    /// so everything buffered is on disk and registered before the slot's
    /// position is confirmed for the last time.
    pub async fn run(mut self) -> CdcResult<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        info!(
            interval_seconds = self.config.interval_seconds,
            max_batch_rows = self.config.max_batch_rows,
            max_batch_size_bytes = self.config.max_batch_size_bytes,
            "batch controller running"
        );

        loop {
            let wakeup = tokio::select! {
                _ = ticker.tick() => Wakeup::Tick,
                _ = self.flush_notify.notified() => Wakeup::Threshold,
                request = self.request_rx.recv(), if !self.requests_closed => {
                    Wakeup::Request(request)
                }
                changed = self.shutdown.changed() => Wakeup::Shutdown {
                    signal_lost: changed.is_err(),
                },
            };

            match wakeup {
                Wakeup::Tick => {
                    self.run_cycle().await?;
                }
                Wakeup::Threshold => {
                    if self.buffers.threshold_exceeded(
                        self.config.max_batch_size_bytes,
                        self.config.max_batch_rows,
                    ) {
                        debug!("size threshold crossed, flushing early");
                        self.run_cycle().await?;
                        ticker.reset();
                    }
                }
                Wakeup::Request(Some(request)) => {
                    let result = match &request.table {
                        Some(table) => self.flush_one(table).await,
                        None => self.run_cycle().await,
                    };
                    // Requester may have timed out; the flush still counts.
                    let _ = request.reply.send(result);
                }
                Wakeup::Request(None) => {
                    self.requests_closed = true;
                }
                Wakeup::Shutdown { signal_lost } => {
                    // A lost signal source means nobody can stop us later;
                    // treat it as a stop.
                    if signal_lost || *self.shutdown.borrow() {
                        info!("shutdown requested, running final flush cycle");
                        self.run_cycle().await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One flush cycle over every table currently eligible to stream.
    #[instrument(skip(self))]
    async fn run_cycle(&mut self) -> CdcResult<()> {
        let registry = self.registry.clone();
        let snapshots = self.buffers.snapshot_and_reset(|table| {
            *table == TableId::global_ddl_bucket()
                || registry.table_mode(table) == Some(TableMode::Streaming)
        });
        self.write_batches(snapshots).await?;
        self.advance_confirmed();
        Ok(())
    }

    /// Forced flush of a single table, regardless of thresholds. Used as the
    /// final pre-reload batch; its end LSN is the last committed position
    /// strictly before the marker.
    async fn flush_one(&mut self, table: &TableId) -> CdcResult<()> {
        let snapshots = self.buffers.snapshot_table(table);
        self.write_batches(snapshots).await
    }

    async fn write_batches(&mut self, snapshots: Vec<TableBatchSnapshot>) -> CdcResult<()> {
        let mut queue = snapshots.into_iter();
        while let Some(snapshot) = queue.next() {
            match self.write_one(&snapshot).await {
                Ok(()) => {
                    self.io_error_streak = 0;
                }
                Err(
                    e @ (CdcError::NonMonotonicLsn { .. } | CdcError::RegistryConflict { .. }),
                ) => {
                    // Prior partial work already covers this range; the
                    // directory has been discarded, drop the snapshot.
                    warn!(table = %snapshot.table, "skipping already-covered batch: {e}");
                }
                Err(e @ CdcError::Fatal { .. }) => return Err(e),
                Err(e) => {
                    self.io_error_streak += 1;
                    if self.io_error_streak >= MAX_IO_ERROR_STREAK {
                        error!("giving up after {} consecutive write failures", self.io_error_streak);
                        return Err(CdcError::fatal(format!(
                            "batch pipeline failed {} times in a row: {e}",
                            self.io_error_streak
                        )));
                    }
                    warn!(table = %snapshot.table, "batch write failed, will retry next cycle: {e}");
                    let mut restore = vec![snapshot];
                    restore.extend(queue);
                    self.buffers.restore_front(restore);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Write one snapshot and register it. The registry insertion happens
    /// only after the directory rename committed; a failed registration
    /// removes the directory again.
    async fn write_one(&self, snapshot: &TableBatchSnapshot) -> CdcResult<()> {
        let timestamp = Utc::now();
        let written = if snapshot.table == TableId::global_ddl_bucket() {
            self.sink
                .write_ddl(&snapshot.table, &snapshot.ddl_events, timestamp)
                .await?
        } else {
            self.sink.write_streaming(snapshot, timestamp).await?
        };

        let record = written.to_record(snapshot.end_lsn);
        if let Err(e) = self.registry.register(&record).await {
            self.sink.discard(&written.directory);
            return Err(e);
        }
        Ok(())
    }

    /// Move the confirmed flush LSN up to the safe checkpoint, held back by
    /// whatever is still buffered. Empty cycles advance it too, as long as
    /// the stream has delivered a safe commit boundary.
    fn advance_confirmed(&mut self) {
        let safe = *self.safe_lsn.borrow();
        if !safe.is_valid() {
            return;
        }
        let include_deltas = self.delta_strategy == DeltaStrategy::Apply;
        let mut candidate = safe;
        for low in self.buffers.pending_low_watermarks(include_deltas) {
            candidate = candidate.min(low.prev());
        }
        if candidate > self.last_confirmed {
            debug!(confirmed = %candidate, "advancing confirmed flush LSN");
            self.confirm.confirm(candidate);
            self.last_confirmed = candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::model::{Change, ChangeKind, FileType};
    use crate::registry::testing::InMemoryRegistry;
    use crate::writer::FileWriter;

    fn users() -> TableId {
        TableId::new("public", "users")
    }

    fn orders() -> TableId {
        TableId::new("public", "orders")
    }

    fn change(lsn: u64) -> Change {
        Change {
            kind: ChangeKind::Insert,
            lsn: Lsn(lsn),
            commit_time: Utc::now(),
            values: vec![Some(format!("{lsn}"))],
            old_values: None,
        }
    }

    struct Fixture {
        buffers: Arc<ChangeBufferSet>,
        registry: Arc<InMemoryRegistry>,
        safe_tx: watch::Sender<Lsn>,
        confirm_rx: watch::Receiver<Lsn>,
        shutdown_tx: watch::Sender<bool>,
        handle: FlushHandle,
        task: tokio::task::JoinHandle<CdcResult<()>>,
    }

    fn start_controller(base: &std::path::Path, tables: &[TableId]) -> Fixture {
        let buffers = Arc::new(ChangeBufferSet::new(DeltaStrategy::Discard));
        let registry = Arc::new(InMemoryRegistry::with_streaming_tables(tables));
        let sink = Arc::new(FileWriter::new(OutputConfig {
            base_path: base.to_path_buf(),
            ..OutputConfig::default()
        }));
        let (confirm, confirm_rx) = ConfirmHandle::channel();
        let (safe_tx, safe_rx) = watch::channel(Lsn::INVALID);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notify = Arc::new(Notify::new());

        let (controller, handle) = BatchController::new(
            buffers.clone(),
            registry.clone(),
            sink,
            confirm,
            BatchControlConfig {
                interval_seconds: 3600, // cycles only run on demand in tests
                max_batch_size_bytes: u64::MAX,
                max_batch_rows: u64::MAX,
            },
            DeltaStrategy::Discard,
            safe_rx,
            notify,
            shutdown_rx,
        );
        let task = tokio::spawn(controller.run());
        Fixture {
            buffers,
            registry,
            safe_tx,
            confirm_rx,
            shutdown_tx,
            handle,
            task,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cycle_writes_and_registers_per_table() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = start_controller(tmp.path(), &[users(), orders()]);
        let header = vec!["id".to_string()];

        fixture.buffers.append_change(&users(), &header, change(0x10)).unwrap();
        fixture.buffers.append_change(&users(), &header, change(0x11)).unwrap();
        fixture.buffers.append_change(&orders(), &header, change(0x12)).unwrap();
        fixture.safe_tx.send(Lsn(0x20)).unwrap();

        fixture.handle.flush_all().await.unwrap();

        let files = fixture.registry.files();
        assert_eq!(files.len(), 2);
        let users_file = files.iter().find(|f| f.table == users()).unwrap();
        assert_eq!(users_file.file_type, FileType::Streaming);
        assert_eq!(users_file.row_count, 2);
        assert_eq!(users_file.end_lsn, Lsn(0x11));
        assert!(std::path::Path::new(&users_file.file_path).exists());

        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_confirm_advances_on_empty_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fixture = start_controller(tmp.path(), &[users()]);

        fixture.safe_tx.send(Lsn(0x100)).unwrap();
        fixture.handle.flush_all().await.unwrap();

        fixture.confirm_rx.changed().await.unwrap();
        assert_eq!(*fixture.confirm_rx.borrow_and_update(), Lsn(0x100));
        assert!(fixture.registry.files().is_empty());

        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_confirm_held_back_by_non_streaming_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fixture = start_controller(tmp.path(), &[users()]);
        let header = vec!["id".to_string()];

        // pending table's rows stay buffered and pin the confirm position
        let pending = TableId::new("public", "pending");
        fixture
            .registry
            .ensure_table_state(&pending)
            .await
            .unwrap();
        fixture.buffers.append_change(&pending, &header, change(0x50)).unwrap();
        fixture.safe_tx.send(Lsn(0x100)).unwrap();

        fixture.handle.flush_all().await.unwrap();

        fixture.confirm_rx.changed().await.unwrap();
        assert_eq!(*fixture.confirm_rx.borrow_and_update(), Lsn(0x4F));
        assert!(fixture.registry.files().is_empty());

        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forced_table_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = start_controller(tmp.path(), &[users(), orders()]);
        let header = vec!["id".to_string()];

        fixture.buffers.append_change(&users(), &header, change(0x10)).unwrap();
        fixture.buffers.append_change(&orders(), &header, change(0x11)).unwrap();

        fixture.handle.flush_table(&users()).await.unwrap();

        let files = fixture.registry.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].table, users());
        // orders stays buffered for the next cycle
        assert!(!fixture.buffers.is_empty());

        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_registration_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = start_controller(tmp.path(), &[users()]);
        let header = vec!["id".to_string()];

        // A record already covers this range.
        fixture
            .registry
            .register(&crate::model::FileRecord {
                table: users(),
                batch_timestamp: Utc::now(),
                file_path: "/already/registered".into(),
                file_type: FileType::Streaming,
                end_lsn: Lsn(0x50),
                row_count: 1,
                has_ddl: false,
                content_hash: None,
            })
            .await
            .unwrap();

        fixture.buffers.append_change(&users(), &header, change(0x20)).unwrap();
        fixture.handle.flush_all().await.unwrap();

        // non-monotonic registration dropped; nothing new registered,
        // directory cleaned up
        assert_eq!(fixture.registry.files().len(), 1);
        let leftover = crate::writer::layout::scan_batch_dirs(tmp.path()).unwrap();
        assert!(leftover.is_empty());

        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_runs_final_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = start_controller(tmp.path(), &[users()]);
        let header = vec!["id".to_string()];

        fixture.buffers.append_change(&users(), &header, change(0x10)).unwrap();
        fixture.shutdown_tx.send(true).unwrap();
        fixture.task.await.unwrap().unwrap();

        assert_eq!(fixture.registry.files().len(), 1);
    }
}
