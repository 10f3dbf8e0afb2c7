//! Replication connection and WAL stream
//!
//! One session opened with `replication=database` drives everything here:
//! IDENTIFY_SYSTEM, slot management, and the CopyBoth stream carrying
//! XLogData frames. Standby status updates go back on the same duplex on a
//! fixed heartbeat and immediately whenever the batch pipeline confirms a
//! newly registered position.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, CopyBothDuplex, NoTls, SimpleQueryMessage};
use tracing::{debug, info, instrument, warn};

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::protocol::buffer::BufferReader;
use crate::protocol::messages::{KeepaliveMessage, StandbyStatusUpdate, XLogDataMessage};
use crate::protocol::parser::MessageParser;
use crate::replication::assembler::{StreamEvent, TransactionAssembler};
use crate::util::pg_now_micros;

/// Result of IDENTIFY_SYSTEM.
#[derive(Debug, Clone)]
pub struct IdentifySystem {
    pub system_id: String,
    pub timeline: String,
    pub xlogpos: Lsn,
}

/// Result of CREATE_REPLICATION_SLOT with an exported snapshot.
#[derive(Debug, Clone)]
pub struct SlotCreation {
    pub consistent_point: Lsn,
    /// Valid until the next command on this replication connection; initial
    /// exports must bind it before streaming starts.
    pub snapshot_name: Option<String>,
}

/// Existing slot facts from pg_replication_slots.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub active: bool,
    pub confirmed_flush_lsn: Option<Lsn>,
}

fn transport(e: tokio_postgres::Error) -> CdcError {
    CdcError::Transport {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

fn start_replication_query(slot: &str, publication: &str, from: Lsn) -> String {
    format!(
        "START_REPLICATION SLOT \"{slot}\" LOGICAL {from} \
         (proto_version '1', publication_names '{publication}')"
    )
}

fn create_slot_query(slot: &str) -> String {
    format!("CREATE_REPLICATION_SLOT \"{slot}\" LOGICAL pgoutput EXPORT_SNAPSHOT")
}

/// Replication-mode session; owner of the slot.
pub struct ReplicationClient {
    client: Client,
    slot_name: String,
    publication: String,
    keepalive_interval: Duration,
}

impl ReplicationClient {
    /// Open the replication session.
    #[instrument(skip(dsn))]
    pub async fn connect(
        dsn: &str,
        slot_name: &str,
        publication: &str,
        keepalive_interval: Duration,
    ) -> CdcResult<Self> {
        let mut config = Config::from_str(dsn).map_err(transport)?;
        config.replication_mode(ReplicationMode::Logical);
        let (client, connection) = config.connect(NoTls).await.map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("replication connection closed: {e}");
            }
        });
        info!(slot_name, publication, "replication session established");
        Ok(Self {
            client,
            slot_name: slot_name.to_string(),
            publication: publication.to_string(),
            keepalive_interval,
        })
    }

    /// Verify the session supports replication and fetch the current WAL
    /// position.
    pub async fn identify_system(&self) -> CdcResult<IdentifySystem> {
        let rows = self
            .client
            .simple_query("IDENTIFY_SYSTEM")
            .await
            .map_err(transport)?;
        for message in rows {
            if let SimpleQueryMessage::Row(row) = message {
                let xlogpos: Lsn = row
                    .get(2)
                    .ok_or_else(|| CdcError::decode("IDENTIFY_SYSTEM missing xlogpos"))?
                    .parse()?;
                return Ok(IdentifySystem {
                    system_id: row.get(0).unwrap_or_default().to_string(),
                    timeline: row.get(1).unwrap_or_default().to_string(),
                    xlogpos,
                });
            }
        }
        Err(CdcError::decode("IDENTIFY_SYSTEM returned no rows"))
    }

    /// Look up the configured slot.
    pub async fn slot_info(&self) -> CdcResult<Option<SlotInfo>> {
        let sql = format!(
            "SELECT active::text, confirmed_flush_lsn::text \
             FROM pg_replication_slots WHERE slot_name = '{}'",
            self.slot_name
        );
        let rows = self.client.simple_query(&sql).await.map_err(transport)?;
        for message in rows {
            if let SimpleQueryMessage::Row(row) = message {
                let active = row.get(0) == Some("true");
                let confirmed_flush_lsn = match row.get(1) {
                    Some(text) if !text.is_empty() => Some(text.parse()?),
                    _ => None,
                };
                return Ok(Some(SlotInfo {
                    active,
                    confirmed_flush_lsn,
                }));
            }
        }
        Ok(None)
    }

    /// Create the slot, exporting a snapshot for the initial table exports.
    #[instrument(skip(self), fields(slot = %self.slot_name))]
    pub async fn create_slot(&self) -> CdcResult<SlotCreation> {
        let rows = self
            .client
            .simple_query(&create_slot_query(&self.slot_name))
            .await?;
        for message in rows {
            if let SimpleQueryMessage::Row(row) = message {
                let consistent_point: Lsn = row
                    .get(1)
                    .ok_or_else(|| CdcError::decode("slot creation missing consistent_point"))?
                    .parse()?;
                let snapshot_name = row.get(2).filter(|s| !s.is_empty()).map(String::from);
                info!(%consistent_point, ?snapshot_name, "created replication slot");
                return Ok(SlotCreation {
                    consistent_point,
                    snapshot_name,
                });
            }
        }
        Err(CdcError::decode("CREATE_REPLICATION_SLOT returned no rows"))
    }

    /// Start streaming from `from` (or the slot's confirmed position when
    /// invalid). Consumes the client; the session now belongs to the stream.
    /// The confirm receiver is handed in so its sending handle survives
    /// reconnects.
    #[instrument(skip(self, confirm_rx), fields(slot = %self.slot_name, %from))]
    pub async fn start(
        self,
        from: Lsn,
        confirm_rx: watch::Receiver<Lsn>,
    ) -> CdcResult<WalStream> {
        let query = start_replication_query(&self.slot_name, &self.publication, from);
        info!(query, "starting replication");
        let duplex = self
            .client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::OBJECT_IN_USE) {
                    CdcError::SlotInUse {
                        slot: self.slot_name.clone(),
                    }
                } else if e.code() == Some(&SqlState::UNDEFINED_OBJECT) {
                    CdcError::SlotMissing {
                        slot: self.slot_name.clone(),
                    }
                } else {
                    transport(e)
                }
            })?;

        Ok(WalStream {
            duplex: Box::pin(duplex),
            _client: self.client,
            assembler: TransactionAssembler::new(),
            received_lsn: from,
            flush_lsn: from,
            confirm_rx,
            confirm_closed: false,
            keepalive_interval: self.keepalive_interval,
            next_heartbeat: Instant::now() + self.keepalive_interval,
        })
    }
}

/// Handle for advancing the confirmed flush LSN from outside the stream
/// task. Never call this for positions that are not yet registered. Only the
/// latest position matters, so this is a watch: receivers can be re-cloned
/// for a replacement stream after a reconnect.
#[derive(Debug, Clone)]
pub struct ConfirmHandle {
    tx: watch::Sender<Lsn>,
}

impl ConfirmHandle {
    /// Build the confirm channel; the receiver side is handed to each
    /// stream, the handle to the batch pipeline.
    pub fn channel() -> (Self, watch::Receiver<Lsn>) {
        let (tx, rx) = watch::channel(Lsn::INVALID);
        (Self { tx }, rx)
    }

    pub fn confirm(&self, lsn: Lsn) {
        self.tx.send_if_modified(|current| {
            if lsn > *current {
                *current = lsn;
                true
            } else {
                false
            }
        });
    }
}

enum Wakeup {
    Frame(Option<Result<Bytes, tokio_postgres::Error>>),
    Confirm { channel_open: bool },
    Heartbeat,
}

/// The live WAL stream: yields committed transactions, schema pins, and
/// safe checkpoints; sends standby status updates.
pub struct WalStream {
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    _client: Client,
    assembler: TransactionAssembler,
    received_lsn: Lsn,
    flush_lsn: Lsn,
    confirm_rx: watch::Receiver<Lsn>,
    confirm_closed: bool,
    keepalive_interval: Duration,
    next_heartbeat: Instant,
}

impl WalStream {
    pub fn confirmed_flush_lsn(&self) -> Lsn {
        self.flush_lsn
    }

    /// Yield the next stream event. Transport failures surface as
    /// `CdcError::Transport` so the caller can reconnect and resume from the
    /// confirmed position.
    pub async fn next_event(&mut self) -> CdcResult<StreamEvent> {
        loop {
            let wakeup = tokio::select! {
                frame = self.duplex.next() => Wakeup::Frame(frame),
                changed = self.confirm_rx.changed(), if !self.confirm_closed => Wakeup::Confirm {
                    channel_open: changed.is_ok(),
                },
                _ = tokio::time::sleep_until(self.next_heartbeat) => Wakeup::Heartbeat,
            };

            match wakeup {
                Wakeup::Heartbeat => {
                    self.send_status(false).await?;
                }
                Wakeup::Confirm { channel_open: true } => {
                    let confirmed = *self.confirm_rx.borrow_and_update();
                    if confirmed > self.flush_lsn {
                        self.flush_lsn = confirmed;
                    }
                    self.send_status(false).await?;
                }
                Wakeup::Confirm { channel_open: false } => {
                    // The ConfirmHandle is gone; stop polling the channel.
                    self.confirm_closed = true;
                }
                Wakeup::Frame(None) => {
                    return Err(CdcError::transport("replication stream ended"));
                }
                Wakeup::Frame(Some(Err(e))) => {
                    return Err(transport(e));
                }
                Wakeup::Frame(Some(Ok(frame))) => {
                    if let Some(event) = self.handle_frame(&frame).await? {
                        return Ok(event);
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> CdcResult<Option<StreamEvent>> {
        match frame.first() {
            Some(b'w') => {
                let xlog = XLogDataMessage::try_from(BufferReader::new(frame))?;
                self.received_lsn = self.received_lsn.max(xlog.wal_end);
                let Some(message) = MessageParser::parse(&xlog.data)? else {
                    return Ok(None);
                };
                debug!(message_type = message.message_type(), "decoded wal message");
                match self.assembler.push(message)? {
                    Some(StreamEvent::Transaction(tx)) => {
                        self.received_lsn = self.received_lsn.max(tx.end_lsn);
                        Ok(Some(StreamEvent::Transaction(tx)))
                    }
                    other => Ok(other),
                }
            }
            Some(b'k') => {
                let keepalive = KeepaliveMessage::try_from(BufferReader::new(frame))?;
                self.received_lsn = self.received_lsn.max(keepalive.wal_end);
                if keepalive.reply_requested {
                    self.send_status(false).await?;
                }
                // Only a checkpoint when no transaction is in flight.
                if self.assembler.is_idle() && keepalive.wal_end.is_valid() {
                    Ok(Some(StreamEvent::Checkpoint {
                        lsn: keepalive.wal_end,
                    }))
                } else {
                    Ok(None)
                }
            }
            Some(other) => {
                warn!("unknown replication frame tag '{}'", *other as char);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Send a standby status update carrying the confirmed flush position.
    pub async fn send_status(&mut self, reply_requested: bool) -> CdcResult<()> {
        let update = StandbyStatusUpdate {
            write_lsn: self.received_lsn,
            flush_lsn: self.flush_lsn,
            apply_lsn: self.flush_lsn,
            client_time_micros: pg_now_micros(),
            reply_requested,
        };
        let bytes = update.to_bytes()?;
        self.duplex
            .send(Bytes::copy_from_slice(&bytes))
            .await
            .map_err(transport)?;
        self.next_heartbeat = Instant::now() + self.keepalive_interval;
        debug!(
            write_lsn = %self.received_lsn,
            flush_lsn = %self.flush_lsn,
            "sent standby status update"
        );
        Ok(())
    }

    /// Final status flush during shutdown.
    pub async fn shutdown(mut self) -> CdcResult<()> {
        // Pick up any confirm that landed just before shutdown.
        let latest = *self.confirm_rx.borrow_and_update();
        if latest > self.flush_lsn {
            self.flush_lsn = latest;
        }
        self.send_status(false).await?;
        info!(flush_lsn = %self.flush_lsn, "replication stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_replication_query() {
        let query = start_replication_query("cdc_slot", "cdc_pub", Lsn(0x16B3720));
        assert_eq!(
            query,
            "START_REPLICATION SLOT \"cdc_slot\" LOGICAL 0/16B3720 \
             (proto_version '1', publication_names 'cdc_pub')"
        );
    }

    #[test]
    fn test_start_from_invalid_lsn_uses_slot_position() {
        let query = start_replication_query("s", "p", Lsn::INVALID);
        assert!(query.contains("LOGICAL 0/0 "));
    }

    #[test]
    fn test_create_slot_query_exports_snapshot() {
        assert_eq!(
            create_slot_query("cdc_slot"),
            "CREATE_REPLICATION_SLOT \"cdc_slot\" LOGICAL pgoutput EXPORT_SNAPSHOT"
        );
    }
}
