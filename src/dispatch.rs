//! Replication dispatcher
//!
//! Single consumer of the WAL stream. Committed transactions are fanned out
//! into the per-table change buffers; inserts on the DDL history table become
//! DdlEvents and, when their command text carries the marker prefix, reload
//! markers. Marker handling runs inline, so a marker takes effect exactly
//! between the changes that precede and follow it in the WAL.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use crate::change_buffer::ChangeBufferSet;
use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::{Change, ChangeKind, DdlEvent, ReloadMarker, TableId, TableMode};
use crate::protocol::messages::{RelationInfo, TupleData};
use crate::registry::RegistryStore;
use crate::reload::MarkerObserver;
use crate::replication::assembler::{CommittedTransaction, StreamEvent, TxEvent};
use crate::util::parse_pg_timestamptz;

pub struct Dispatcher {
    registry: Arc<dyn RegistryStore>,
    buffers: Arc<ChangeBufferSet>,
    markers: Arc<dyn MarkerObserver>,
    /// Safe checkpoint published for the batch controller's confirm logic.
    safe_lsn: watch::Sender<Lsn>,
    flush_notify: Arc<Notify>,
    relations: HashMap<u32, RelationInfo>,
    /// Highest commit processed; a reconnect replays from the confirmed
    /// position, and commits at or below this are already buffered.
    last_commit_lsn: Lsn,
    /// Tables seen in the stream but absent from the registry; warned once.
    unknown_tables: HashSet<TableId>,
    ddl_history: TableId,
    marker_prefix: String,
    max_batch_size_bytes: u64,
    max_batch_rows: u64,
}

/// Split `schema.table` from configuration into a TableId.
fn parse_qualified_table(qualified: &str) -> TableId {
    match qualified.split_once('.') {
        Some((schema, name)) => TableId::new(schema, name),
        None => TableId::new("public", qualified),
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        buffers: Arc<ChangeBufferSet>,
        markers: Arc<dyn MarkerObserver>,
        safe_lsn: watch::Sender<Lsn>,
        flush_notify: Arc<Notify>,
        ddl_history_table: &str,
        marker_prefix: String,
        max_batch_size_bytes: u64,
        max_batch_rows: u64,
    ) -> Self {
        Self {
            registry,
            buffers,
            markers,
            safe_lsn,
            flush_notify,
            relations: HashMap::new(),
            last_commit_lsn: Lsn::INVALID,
            unknown_tables: HashSet::new(),
            ddl_history: parse_qualified_table(ddl_history_table),
            marker_prefix,
            max_batch_size_bytes,
            max_batch_rows,
        }
    }

    pub async fn handle_event(&mut self, event: StreamEvent) -> CdcResult<()> {
        match event {
            StreamEvent::Relation(relation) => {
                debug!(table = %relation.table_id(), "pinned relation schema");
                self.relations.insert(relation.oid, relation);
                Ok(())
            }
            StreamEvent::Checkpoint { lsn } => {
                self.publish_safe(lsn);
                Ok(())
            }
            StreamEvent::Transaction(tx) => self.handle_transaction(tx).await,
        }
    }

    async fn handle_transaction(&mut self, tx: CommittedTransaction) -> CdcResult<()> {
        if self.last_commit_lsn.is_valid() && tx.commit_lsn <= self.last_commit_lsn {
            // Row changes are already buffered, but the session still needs
            // the schema pins carried by the replayed transaction.
            debug!(commit_lsn = %tx.commit_lsn, "skipping replayed transaction");
            for event in tx.events {
                if let TxEvent::Relation(relation) = event {
                    self.relations.insert(relation.oid, relation);
                }
            }
            self.publish_safe(tx.end_lsn);
            return Ok(());
        }
        self.last_commit_lsn = tx.commit_lsn;

        let commit_lsn = tx.commit_lsn;
        let commit_time = tx.commit_time;

        for event in tx.events {
            match event {
                TxEvent::Relation(relation) => {
                    self.relations.insert(relation.oid, relation);
                }
                TxEvent::Insert {
                    relation_oid,
                    new_tuple,
                } => {
                    let relation = self.relation(relation_oid)?.clone();
                    if relation.table_id() == self.ddl_history {
                        self.handle_ddl_row(&relation, new_tuple, commit_lsn, commit_time)
                            .await?;
                    } else {
                        self.route_change(
                            &relation,
                            Change {
                                kind: ChangeKind::Insert,
                                lsn: commit_lsn,
                                commit_time,
                                values: new_tuple.into_values(),
                                old_values: None,
                            },
                        )?;
                    }
                }
                TxEvent::Update {
                    relation_oid,
                    old_tuple,
                    new_tuple,
                } => {
                    let relation = self.relation(relation_oid)?.clone();
                    if relation.table_id() == self.ddl_history {
                        continue;
                    }
                    self.route_change(
                        &relation,
                        Change {
                            kind: ChangeKind::Update,
                            lsn: commit_lsn,
                            commit_time,
                            values: new_tuple.into_values(),
                            old_values: old_tuple.map(TupleData::into_values),
                        },
                    )?;
                }
                TxEvent::Delete {
                    relation_oid,
                    old_tuple,
                } => {
                    let relation = self.relation(relation_oid)?.clone();
                    if relation.table_id() == self.ddl_history {
                        continue;
                    }
                    self.route_change(
                        &relation,
                        Change {
                            kind: ChangeKind::Delete,
                            lsn: commit_lsn,
                            commit_time,
                            values: Vec::new(),
                            old_values: Some(old_tuple.into_values()),
                        },
                    )?;
                }
                TxEvent::Truncate { relation_oids } => {
                    for oid in relation_oids {
                        let relation = self.relation(oid)?.clone();
                        if relation.table_id() == self.ddl_history {
                            continue;
                        }
                        self.route_change(
                            &relation,
                            Change {
                                kind: ChangeKind::Truncate,
                                lsn: commit_lsn,
                                commit_time,
                                values: Vec::new(),
                                old_values: None,
                            },
                        )?;
                    }
                }
            }
        }

        self.publish_safe(tx.end_lsn);
        if self
            .buffers
            .threshold_exceeded(self.max_batch_size_bytes, self.max_batch_rows)
        {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    fn relation(&self, oid: u32) -> CdcResult<&RelationInfo> {
        self.relations.get(&oid).ok_or_else(|| {
            CdcError::decode(format!("row event references unknown relation {oid}"))
        })
    }

    /// Append a change to the table's buffer, or its delta buffer while the
    /// table reloads.
    fn route_change(&mut self, relation: &RelationInfo, change: Change) -> CdcResult<()> {
        let table = relation.table_id();
        let header = relation.column_names();
        match self.registry.table_mode(&table) {
            Some(TableMode::Streaming) | Some(TableMode::PendingReload) => {
                self.buffers.append_change(&table, &header, change)
            }
            Some(TableMode::Reloading) => {
                self.buffers.append_delta(&table, &header, change);
                Ok(())
            }
            None => {
                if self.unknown_tables.insert(table.clone()) {
                    warn!(
                        table = %table,
                        "change for a table the registry does not track; skipping \
                         (it will be picked up at the next startup)"
                    );
                }
                Ok(())
            }
        }
    }

    /// An insert on the DDL history table: build the DdlEvent, detect reload
    /// markers, and route ordinary DDL to the affected table's batch.
    async fn handle_ddl_row(
        &mut self,
        relation: &RelationInfo,
        tuple: TupleData,
        commit_lsn: Lsn,
        commit_time: chrono::DateTime<chrono::Utc>,
    ) -> CdcResult<()> {
        let columns = relation.column_names();
        let values = tuple.into_values();
        let field = |name: &str| -> Option<String> {
            columns
                .iter()
                .position(|c| c == name)
                .and_then(|i| values.get(i).cloned())
                .flatten()
        };

        let Some(command_text) = field("command_text") else {
            warn!("ddl_history row without command_text, skipping");
            return Ok(());
        };

        let event = DdlEvent {
            captured_at: field("captured_at")
                .as_deref()
                .and_then(parse_pg_timestamptz)
                .unwrap_or(commit_time),
            object_type: field("object_type").unwrap_or_default(),
            table: match (field("schema_name"), field("object_name")) {
                (Some(schema), Some(name)) if !schema.is_empty() && !name.is_empty() => {
                    Some(TableId::new(schema, name))
                }
                _ => None,
            },
            tag: field("tag").unwrap_or_default(),
            command_text,
            lsn: commit_lsn,
        };

        match ReloadMarker::parse(&self.marker_prefix, &event.command_text, commit_lsn) {
            Ok(Some(marker)) => {
                // Marker handling is synchronous with dispatch; everything
                // buffered so far precedes the marker, everything after
                // follows it.
                return self.markers.handle_marker(marker).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("malformed reload marker ignored: {e}");
                return Ok(());
            }
        }

        let bucket = match &event.table {
            Some(table) if self.registry.table_mode(table).is_some() => table.clone(),
            _ => TableId::global_ddl_bucket(),
        };
        debug!(table = %bucket, tag = %event.tag, "captured ddl event");
        self.buffers.append_ddl(&bucket, event);
        Ok(())
    }

    fn publish_safe(&self, lsn: Lsn) {
        if lsn > *self.safe_lsn.borrow() {
            let _ = self.safe_lsn.send(lsn);
        }
    }
}
