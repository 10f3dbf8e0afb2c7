//! Logical replication streaming
//!
//! Connects to the source in replication mode, manages the slot, and turns
//! the raw CopyBoth byte stream into committed transactions. The client is
//! the sole owner of the slot's confirmed flush LSN; nothing here advances it
//! past what the batch pipeline has registered.

pub mod assembler;
pub mod client;

pub use assembler::{CommittedTransaction, StreamEvent, TransactionAssembler, TxEvent};
pub use client::{ConfirmHandle, IdentifySystem, ReplicationClient, SlotCreation, WalStream};
