//! PostgreSQL replication wire protocol
//!
//! Hand-rolled decoding of the replication framing messages (XLogData,
//! keepalive, standby status update) and the pgoutput logical replication
//! message set. Framing layouts follow
//! <https://www.postgresql.org/docs/current/protocol-replication.html>.

pub mod buffer;
pub mod messages;
pub mod parser;

pub use buffer::{BufferReader, BufferWriter};
pub use messages::{
    KeepaliveMessage, RelationColumn, RelationInfo, StandbyStatusUpdate, TupleData, TupleValue,
    WalMessage, XLogDataMessage,
};
pub use parser::MessageParser;
