//! Pipeline assembly and lifecycle
//!
//! Wires the long-lived tasks together: the replication dispatcher feeding
//! the change buffers, the batch controller, the export worker pool, and the
//! reload coordinator. Boot goes through startup's fresh-init/resume
//! decision; teardown quiesces in order (markers first, then a final flush
//! and confirm, then the replication session).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchController, FlushControl};
use crate::change_buffer::ChangeBufferSet;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::errors::{CdcError, CdcResult};
use crate::export::{ExportDispatch, ExportJob, ExportKind, ExportWorkerPool, SlotSnapshot};
use crate::lsn::Lsn;
use crate::model::{TableId, TableMode};
use crate::registry::{Registry, RegistryStore};
use crate::reload::{MarkerObserver, ReloadCoordinator};
use crate::replication::client::{ConfirmHandle, ReplicationClient, WalStream};
use crate::startup::{
    AdminClient, apply_reconcile, compute_resume_lsn, plan_reconcile, reloads_needing_retry,
};
use crate::writer::{BatchSink, FileWriter, layout};

struct BootPlan {
    resume_from: Lsn,
    jobs: Vec<ExportJob>,
    /// Snapshot-bound acknowledgements to await before streaming starts;
    /// non-empty only on fresh init, where the exported snapshot dies with
    /// the next command on the replication connection.
    binds: Vec<oneshot::Receiver<()>>,
}

/// Run the whole service until the shutdown signal flips.
pub async fn run(config: Arc<Config>, mut shutdown: watch::Receiver<bool>) -> CdcResult<()> {
    let registry = Arc::new(Registry::connect(config.sql_dsn(), &config.registry.schema).await?);
    let registry_store: Arc<dyn RegistryStore> = registry.clone();
    let admin = AdminClient::connect(config.sql_dsn()).await?;
    let sink: Arc<dyn BatchSink> = Arc::new(FileWriter::new(config.output.clone()));
    let buffers = Arc::new(ChangeBufferSet::new(config.reload_coordination.delta_strategy));

    let (safe_tx, safe_rx) = watch::channel(Lsn::INVALID);
    let flush_notify = Arc::new(Notify::new());
    let (confirm_handle, confirm_rx) = ConfirmHandle::channel();

    let keepalive = Duration::from_secs(config.replication.keepalive_interval_seconds);
    let replication = ReplicationClient::connect(
        config.sql_dsn(),
        &config.replication.slot_name,
        &config.replication.publication_name,
        keepalive,
    )
    .await?;

    admin.install_ddl_capture().await?;

    let (controller, flush_handle) = BatchController::new(
        buffers.clone(),
        registry_store.clone(),
        sink.clone(),
        confirm_handle.clone(),
        config.batch_control.clone(),
        config.reload_coordination.delta_strategy,
        safe_rx,
        flush_notify.clone(),
        shutdown.clone(),
    );
    let controller_task = tokio::spawn(controller.run());

    let (results_tx, mut results_rx) = mpsc::channel(32);
    let pool = ExportWorkerPool::spawn(
        config.sql_dsn().to_string(),
        config.workers.max_export_workers,
        Duration::from_secs(config.workers.statement_timeout_seconds),
        config.reload_coordination.marker_prefix.clone(),
        sink.clone(),
        registry_store.clone(),
        results_tx,
        shutdown.clone(),
    );

    let coordinator = Arc::new(ReloadCoordinator::new(
        registry_store.clone(),
        buffers.clone(),
        sink.clone(),
        Arc::new(flush_handle.clone()),
        Arc::new(pool.clone()),
        config.reload_coordination.clone(),
    ));

    // Export results and reload deadlines are handled off the hot path.
    {
        let coordinator = coordinator.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            enum Tick {
                Result(Option<crate::export::ExportResult>),
                Sweep,
                Shutdown { signal_lost: bool },
            }
            let mut sweep = tokio::time::interval(Duration::from_secs(60));
            sweep.tick().await;
            loop {
                let tick = tokio::select! {
                    result = results_rx.recv() => Tick::Result(result),
                    _ = sweep.tick() => Tick::Sweep,
                    changed = shutdown.changed() => Tick::Shutdown {
                        signal_lost: changed.is_err(),
                    },
                };
                match tick {
                    Tick::Result(Some(result)) => {
                        if let Err(e) = coordinator.handle_export_result(result).await {
                            error!("export result handling failed: {e}");
                        }
                    }
                    Tick::Result(None) => break,
                    Tick::Sweep => {
                        if let Err(e) = coordinator.sweep_timeouts().await {
                            warn!("reload timeout sweep failed: {e}");
                        }
                    }
                    Tick::Shutdown { signal_lost } => {
                        if signal_lost || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let system = replication.identify_system().await?;
    info!(
        system_id = %system.system_id,
        timeline = %system.timeline,
        xlogpos = %system.xlogpos,
        "source system identified"
    );

    // Fresh init or resume.
    let boot = match replication.slot_info().await? {
        Some(info) if info.active => {
            return Err(CdcError::SlotInUse {
                slot: config.replication.slot_name.clone(),
            });
        }
        Some(info) => resume(&config, &admin, &registry).await.map(|mut plan| {
            plan.resume_from =
                compute_resume_lsn(&registry.table_states(), info.confirmed_flush_lsn);
            plan
        })?,
        None => fresh_init(&config, &admin, &registry, &replication).await?,
    };

    for job in boot.jobs {
        pool.dispatch(job).await?;
    }
    let bind_deadline = Duration::from_secs(config.workers.statement_timeout_seconds);
    for bind in boot.binds {
        // A dead worker surfaces through the results channel; treat a
        // dropped acknowledgement as fatal for init.
        match tokio::time::timeout(bind_deadline, bind).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(CdcError::snapshot("initial export worker died before binding"));
            }
            Err(_) => {
                return Err(CdcError::timeout(
                    "waiting for initial exports to bind the slot snapshot",
                    bind_deadline.as_secs(),
                ));
            }
        }
    }

    let mut stream = replication.start(boot.resume_from, confirm_rx.clone()).await?;
    let mut dispatcher = Dispatcher::new(
        registry_store.clone(),
        buffers.clone(),
        coordinator.clone() as Arc<dyn MarkerObserver>,
        safe_tx,
        flush_notify.clone(),
        &config.replication.ddl_history_table,
        config.reload_coordination.marker_prefix.clone(),
        config.batch_control.max_batch_size_bytes,
        config.batch_control.max_batch_rows,
    );

    info!("pipeline running");

    enum Next {
        Event(CdcResult<crate::replication::assembler::StreamEvent>),
        Shutdown { signal_lost: bool },
    }

    loop {
        // Consumer-driven backpressure: when buffers outgrow the flush
        // limits despite threshold flushes, stop pulling from the stream
        // until the controller drains them. The slot retains WAL on the
        // source meanwhile.
        while buffers.threshold_exceeded(
            config.batch_control.max_batch_size_bytes.saturating_mul(2),
            config.batch_control.max_batch_rows.saturating_mul(2),
        ) && !*shutdown.borrow()
        {
            flush_notify.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => Next::Shutdown {
                signal_lost: changed.is_err(),
            },
            event = stream.next_event() => Next::Event(event),
        };
        match next {
            Next::Shutdown { signal_lost } => {
                if signal_lost || *shutdown.borrow() {
                    break;
                }
            }
            Next::Event(Ok(event)) => dispatcher.handle_event(event).await?,
            Next::Event(Err(e)) if e.is_transport() => {
                warn!("replication transport failed, reconnecting: {e}");
                let resume_at = stream.confirmed_flush_lsn();
                drop(stream);
                stream = reconnect(&config, keepalive, resume_at, confirm_rx.clone(), &mut shutdown)
                    .await?;
            }
            Next::Event(Err(e)) => return Err(e),
        }
    }

    // Graceful quiesce: no new marker actions, one final registered flush,
    // final confirm, then close the stream and let the pools drop.
    info!("shutting down");
    coordinator.stop_accepting();
    if let Err(e) = flush_handle.flush_all().await {
        warn!("final flush request failed (controller already stopped): {e}");
    }
    match controller_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("batch controller exited with error during shutdown: {e}"),
        Err(e) => warn!("batch controller task panicked: {e}"),
    }
    stream.shutdown().await?;
    info!("shutdown complete");
    Ok(())
}

/// Fresh init: create the slot with an exported snapshot, discover target
/// tables, and queue their initial exports against that snapshot.
async fn fresh_init(
    config: &Config,
    admin: &AdminClient,
    registry: &Registry,
    replication: &ReplicationClient,
) -> CdcResult<BootPlan> {
    info!("no replication slot found, running fresh initialization");

    let tables = admin
        .target_tables(&config.replication.publication_name, &config.tables)
        .await?;
    if tables.is_empty() {
        return Err(CdcError::config(format!(
            "publication '{}' matches no eligible tables",
            config.replication.publication_name
        )));
    }
    for table in &tables {
        registry.ensure_table_state(table).await?;
    }

    let slot = replication.create_slot().await?;
    let snapshot = slot.snapshot_name.as_ref().map(|name| SlotSnapshot {
        name: name.clone(),
        consistent_point: slot.consistent_point,
    });

    let pending: Vec<TableId> = registry
        .table_states()
        .into_iter()
        .filter(|s| s.mode == TableMode::PendingReload)
        .map(|s| s.table)
        .collect();
    let ordered = smallest_first(admin, pending).await;

    let mut jobs = Vec::with_capacity(ordered.len());
    let mut binds = Vec::with_capacity(ordered.len());
    for table in ordered {
        let (bound_tx, bound_rx) = oneshot::channel();
        jobs.push(ExportJob {
            table,
            export_id: Uuid::new_v4(),
            kind: ExportKind::Initial {
                snapshot: snapshot.clone(),
            },
            snapshot_bound: Some(bound_tx),
        });
        binds.push(bound_rx);
    }

    Ok(BootPlan {
        resume_from: Lsn::INVALID,
        jobs,
        binds,
    })
}

/// Resume: reconcile registry and filesystem, retry interrupted work, pick
/// up tables added since the last run.
async fn resume(config: &Config, admin: &AdminClient, registry: &Registry) -> CdcResult<BootPlan> {
    info!("replication slot exists, resuming");

    // Tables added to the publication since the last run start fresh.
    let tables = admin
        .target_tables(&config.replication.publication_name, &config.tables)
        .await?;
    for table in &tables {
        registry.ensure_table_state(table).await?;
    }

    let records = registry.file_records().await?;
    let plan = plan_reconcile(&config.output.base_path, &records)?;
    apply_reconcile(plan, registry).await?;

    let records = registry.file_records().await?;
    let retries = reloads_needing_retry(registry, &records).await?;

    if let Some(days) = config.registry.cleanup_after_days {
        for path in registry.cleanup_superseded(days).await? {
            if let Some(dir) = std::path::Path::new(&path).parent() {
                layout::remove_batch_dir(dir);
            }
        }
    }

    let mut jobs = Vec::new();
    for operation in retries {
        jobs.push(ExportJob {
            table: operation.table.clone(),
            export_id: operation.export_id,
            kind: ExportKind::Reload {
                anchor_lsn: operation.start_marker_lsn,
            },
            snapshot_bound: None,
        });
    }

    let pending: Vec<TableId> = registry
        .table_states()
        .into_iter()
        .filter(|s| s.mode == TableMode::PendingReload)
        .map(|s| s.table)
        .collect();
    for table in smallest_first(admin, pending).await {
        jobs.push(ExportJob {
            table,
            export_id: Uuid::new_v4(),
            kind: ExportKind::Initial { snapshot: None },
            snapshot_bound: None,
        });
    }

    Ok(BootPlan {
        resume_from: Lsn::INVALID,
        jobs,
        binds: Vec::new(),
    })
}

/// Order export candidates by their current size estimate so the pool turns
/// small tables streamable first.
async fn smallest_first(admin: &AdminClient, tables: Vec<TableId>) -> Vec<TableId> {
    let mut sized = Vec::with_capacity(tables.len());
    for table in tables {
        let size = admin.relation_size(&table).await.unwrap_or(i64::MAX);
        sized.push((size, table));
    }
    sized.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    sized.into_iter().map(|(_, table)| table).collect()
}

/// Rebuild the replication session after a transport failure, resuming from
/// the last confirmed position with capped exponential backoff.
async fn reconnect(
    config: &Config,
    keepalive: Duration,
    resume_at: Lsn,
    confirm_rx: watch::Receiver<Lsn>,
    shutdown: &mut watch::Receiver<bool>,
) -> CdcResult<WalStream> {
    let mut delay = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            return Err(CdcError::transport("shutdown during reconnect"));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(60));

        let client = match ReplicationClient::connect(
            config.sql_dsn(),
            &config.replication.slot_name,
            &config.replication.publication_name,
            keepalive,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!("reconnect attempt failed: {e}");
                continue;
            }
        };
        match client.start(resume_at, confirm_rx.clone()).await {
            Ok(stream) => {
                info!(resume_at = %resume_at, "replication stream re-established");
                return Ok(stream);
            }
            Err(e @ CdcError::SlotInUse { .. }) => return Err(e),
            Err(e @ CdcError::SlotMissing { .. }) => return Err(e),
            Err(e) => warn!("restart of replication failed: {e}"),
        }
    }
}
