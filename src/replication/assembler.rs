//! Transaction scratchpad
//!
//! pgoutput emits row messages between a Begin and a Commit. Everything in
//! between is retained here and released atomically when the Commit arrives,
//! so downstream only ever sees whole committed transactions in commit
//! order. Every row is stamped with the commit LSN: per-message WAL
//! positions of concurrent transactions can interleave, commit LSNs cannot,
//! and that is what keeps per-table buffers monotonic.

use chrono::{DateTime, Utc};

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::protocol::messages::{RelationInfo, TupleData, WalMessage};
use crate::util::pg_micros_to_utc;

/// One event inside a committed transaction, in emission order.
#[derive(Debug, Clone)]
pub enum TxEvent {
    /// Schema pin; applies to all later rows of the relation, including in
    /// subsequent transactions.
    Relation(RelationInfo),
    Insert {
        relation_oid: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_oid: u32,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_oid: u32,
        old_tuple: TupleData,
    },
    Truncate {
        relation_oids: Vec<u32>,
    },
}

/// A transaction released from the scratchpad.
#[derive(Debug, Clone)]
pub struct CommittedTransaction {
    pub commit_lsn: Lsn,
    /// End of the commit record; the safe resume point after this
    /// transaction.
    pub end_lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    pub events: Vec<TxEvent>,
}

impl CommittedTransaction {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What the replication stream yields to the dispatcher.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Transaction(CommittedTransaction),
    /// Schema pin observed outside any transaction.
    Relation(RelationInfo),
    /// The server reported WAL up to `lsn` with no pending row data;
    /// a safe place to advance the confirmed position of idle tables.
    Checkpoint { lsn: Lsn },
}

#[derive(Debug)]
struct PendingTx {
    final_lsn: Lsn,
    events: Vec<TxEvent>,
}

/// Assembles pgoutput messages into [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct TransactionAssembler {
    current: Option<PendingTx>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transaction is currently open. Keepalives may only become
    /// checkpoints while this is false.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Feed one decoded message; returns an event when one is released.
    pub fn push(&mut self, message: WalMessage) -> CdcResult<Option<StreamEvent>> {
        match message {
            WalMessage::Begin { final_lsn, .. } => {
                if self.current.is_some() {
                    return Err(CdcError::decode("Begin while a transaction is open"));
                }
                self.current = Some(PendingTx {
                    final_lsn,
                    events: Vec::new(),
                });
                Ok(None)
            }

            WalMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time_micros,
                ..
            } => {
                let pending = self
                    .current
                    .take()
                    .ok_or_else(|| CdcError::decode("Commit without Begin"))?;
                if pending.final_lsn.is_valid() && pending.final_lsn != commit_lsn {
                    return Err(CdcError::decode_with_context(
                        "commit LSN does not match Begin's final LSN",
                        format!("begin={} commit={commit_lsn}", pending.final_lsn),
                    ));
                }
                Ok(Some(StreamEvent::Transaction(CommittedTransaction {
                    commit_lsn,
                    end_lsn,
                    commit_time: pg_micros_to_utc(commit_time_micros),
                    events: pending.events,
                })))
            }

            WalMessage::Relation { relation } => match self.current.as_mut() {
                Some(tx) => {
                    tx.events.push(TxEvent::Relation(relation));
                    Ok(None)
                }
                None => Ok(Some(StreamEvent::Relation(relation))),
            },

            WalMessage::Origin { .. } => Ok(None),

            WalMessage::Insert {
                relation_oid,
                new_tuple,
            } => self.push_row(TxEvent::Insert {
                relation_oid,
                new_tuple,
            }),

            WalMessage::Update {
                relation_oid,
                old_tuple,
                new_tuple,
                ..
            } => self.push_row(TxEvent::Update {
                relation_oid,
                old_tuple,
                new_tuple,
            }),

            WalMessage::Delete {
                relation_oid,
                old_tuple,
                ..
            } => self.push_row(TxEvent::Delete {
                relation_oid,
                old_tuple,
            }),

            WalMessage::Truncate { relation_oids, .. } => {
                self.push_row(TxEvent::Truncate { relation_oids })
            }
        }
    }

    fn push_row(&mut self, event: TxEvent) -> CdcResult<Option<StreamEvent>> {
        match self.current.as_mut() {
            Some(tx) => {
                tx.events.push(event);
                Ok(None)
            }
            None => Err(CdcError::decode("row event outside a transaction")),
        }
    }
}
