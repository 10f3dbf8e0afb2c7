//! Typed replication messages
//!
//! Two layers share this module. The framing layer carries raw WAL payloads
//! and keepalives inside CopyData messages; the logical layer is the pgoutput
//! message set describing transactions and row changes. The stream uses
//! protocol version 1, so every message between a Begin and its Commit
//! belongs to one committed transaction in commit order.

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::model::TableId;
use crate::protocol::buffer::{BufferReader, BufferWriter};

/// Information about a column carried by a Relation message
///
/// # Fields
///
/// * `key_flag` - Bit 1 set when the column is part of the replica identity key
/// * `name` - The column name as defined in the database
/// * `type_oid` - PostgreSQL OID of the column's data type
/// * `atttypmod` - Type modifier (such as varchar length)
#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    pub key_flag: i8,
    pub name: String,
    pub type_oid: u32,
    pub atttypmod: i32,
}

/// Schema descriptor for a table, sent ahead of row events referring to it
///
/// # Fields
///
/// * `oid` - OID uniquely identifying the table on the source
/// * `namespace` - Schema name
/// * `name` - Table name
/// * `replica_identity` - 'd' default, 'f' full, 'i' index, 'n' nothing
/// * `columns` - Column descriptors in emission order
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<RelationColumn>,
}

impl RelationInfo {
    pub fn table_id(&self) -> TableId {
        TableId::new(self.namespace.clone(), self.name.clone())
    }

    /// Column names in emission order; this pins the CSV column order for
    /// batches of this table.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One value inside a tuple
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    /// TOASTed value that did not change; no data is transmitted.
    UnchangedToast,
    Text(String),
}

/// All column values for one row, in relation column order
#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    pub values: Vec<TupleValue>,
}

impl TupleData {
    /// Flatten to optional strings for buffering and CSV output. Unchanged
    /// TOAST values carry no data on the wire and surface as None.
    pub fn into_values(self) -> Vec<Option<String>> {
        self.values
            .into_iter()
            .map(|v| match v {
                TupleValue::Null | TupleValue::UnchangedToast => None,
                TupleValue::Text(s) => Some(s),
            })
            .collect()
    }
}

/// Logical replication messages decoded from XLogData payloads
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    /// Transaction start; subsequent messages belong to this transaction
    /// until Commit.
    Begin {
        final_lsn: Lsn,
        commit_time_micros: i64,
        xid: u32,
    },

    /// Transaction commit; all changes in the transaction are now durable.
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time_micros: i64,
    },

    /// Replication origin of the following transaction; informational.
    Origin { commit_lsn: Lsn, name: String },

    /// Table schema information, sent once per table per session and again
    /// whenever the table's definition changes.
    Relation { relation: RelationInfo },

    /// Row insertion.
    Insert {
        relation_oid: u32,
        new_tuple: TupleData,
    },

    /// Row modification. `old_tuple` is present only when the replica
    /// identity provides it; `key_type` is 'K' (index) or 'O' (full old row).
    Update {
        relation_oid: u32,
        key_type: Option<char>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },

    /// Row deletion; the tuple is the replica identity key or full old row.
    Delete {
        relation_oid: u32,
        key_type: char,
        old_tuple: TupleData,
    },

    /// Bulk removal of all rows from one or more tables.
    Truncate { relation_oids: Vec<u32>, flags: i8 },
}

impl WalMessage {
    /// Get the message type as a string for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            WalMessage::Begin { .. } => "Begin",
            WalMessage::Commit { .. } => "Commit",
            WalMessage::Origin { .. } => "Origin",
            WalMessage::Relation { .. } => "Relation",
            WalMessage::Insert { .. } => "Insert",
            WalMessage::Update { .. } => "Update",
            WalMessage::Delete { .. } => "Delete",
            WalMessage::Truncate { .. } => "Truncate",
        }
    }
}

// https://www.postgresql.org/docs/current/protocol-replication.html#PROTOCOL-REPLICATION-XLOGDATA-MESSAGE
pub struct XLogDataMessage {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub send_time_micros: i64,
    pub data: Vec<u8>,
}

impl TryFrom<BufferReader<'_>> for XLogDataMessage {
    type Error = CdcError;

    fn try_from(mut reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(25) {
            return Err(CdcError::decode("WAL data message too short"));
        }
        let tag = reader.read_char()?;
        if tag != 'w' {
            return Err(CdcError::decode(format!("expected XLogData tag, got '{tag}'")));
        }
        let wal_start = Lsn(reader.read_u64()?);
        let wal_end = Lsn(reader.read_u64()?);
        let send_time_micros = reader.read_i64()?;
        let data = reader.read_bytes(reader.remaining())?;
        Ok(XLogDataMessage {
            wal_start,
            wal_end,
            send_time_micros,
            data,
        })
    }
}

// https://www.postgresql.org/docs/current/protocol-replication.html#PROTOCOL-REPLICATION-PRIMARY-KEEPALIVE-MESSAGE
pub struct KeepaliveMessage {
    pub wal_end: Lsn,
    pub send_time_micros: i64,
    pub reply_requested: bool,
}

impl TryFrom<BufferReader<'_>> for KeepaliveMessage {
    type Error = CdcError;

    fn try_from(mut reader: BufferReader<'_>) -> Result<Self, Self::Error> {
        if !reader.has_bytes(18) {
            return Err(CdcError::decode("keepalive message too short"));
        }
        let tag = reader.read_char()?;
        if tag != 'k' {
            return Err(CdcError::decode(format!("expected keepalive tag, got '{tag}'")));
        }
        let wal_end = Lsn(reader.read_u64()?);
        let send_time_micros = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;
        Ok(KeepaliveMessage {
            wal_end,
            send_time_micros,
            reply_requested,
        })
    }
}

// https://www.postgresql.org/docs/current/protocol-replication.html#PROTOCOL-REPLICATION-STANDBY-STATUS-UPDATE
pub struct StandbyStatusUpdate {
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
    pub client_time_micros: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub const WIRE_LEN: usize = 34;

    /// Serialize into the 'r' reply payload sent back inside CopyData.
    pub fn to_bytes(&self) -> CdcResult<[u8; Self::WIRE_LEN]> {
        let mut buf = [0u8; Self::WIRE_LEN];
        let written = {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(b'r')?;
            writer.write_u64(self.write_lsn.0)?;
            writer.write_u64(self.flush_lsn.0)?;
            writer.write_u64(self.apply_lsn.0)?;
            writer.write_i64(self.client_time_micros)?;
            writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
            writer.bytes_written()
        };
        if written != Self::WIRE_LEN {
            return Err(CdcError::decode("failed to serialize status update"));
        }
        Ok(buf)
    }
}
