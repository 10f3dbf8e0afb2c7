//! Error types for the CDC egress service
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

/// Main error type for the CDC egress service
#[derive(Error, Debug)]
pub enum CdcError {
    /// Source connection lost or unreachable; recovered locally by
    /// reconnecting and resuming from the last confirmed LSN
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed WAL content; fatal for the affected message
    #[error("Decode error: {message}")]
    Decode {
        message: String,
        context: Option<String>,
    },

    /// The configured replication slot does not exist and the process
    /// is not in fresh-init mode
    #[error("Replication slot '{slot}' does not exist")]
    SlotMissing { slot: String },

    /// Another process currently holds the replication slot
    #[error("Replication slot '{slot}' is in use by another consumer")]
    SlotInUse { slot: String },

    /// Registry monotonicity or uniqueness violation detected during a
    /// registration transaction
    #[error("Registry conflict: {message}")]
    RegistryConflict { message: String },

    /// A streaming or full-reload record would move a table's end LSN backwards
    #[error("Non-monotonic LSN for {table}: {attempted} <= {current}")]
    NonMonotonicLsn {
        table: String,
        current: String,
        attempted: String,
    },

    /// A reload operation is already active for the table
    #[error("Reload already active for {table}")]
    ReloadAlreadyActive { table: String },

    /// File system failure while producing a batch
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// CSV serialization failure while producing a batch
    #[error("CSV error")]
    Csv(#[from] csv::Error),

    /// The snapshot backing an export could not be established or imported
    #[error("Snapshot unavailable: {message}")]
    SnapshotUnavailable { message: String },

    /// A reload marker comment did not parse; logged and ignored by callers
    #[error("Malformed reload marker: {message}")]
    MarkerMalformed { message: String },

    /// A bounded operation exceeded its deadline
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invariant violation; the process exits for external supervision to restart
    #[error("Fatal: {message}")]
    Fatal { message: String },

    /// Errors surfaced by the PostgreSQL driver
    #[error("Database error")]
    Database(#[from] tokio_postgres::Error),

    /// String conversion errors
    #[error("String conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// Task execution errors for async operations
    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type CdcResult<T> = std::result::Result<T, CdcError>;

impl CdcError {
    /// Create a transport error with context
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
            context: None,
        }
    }

    /// Create a decode error with context
    pub fn decode_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Decode {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a registry conflict error
    pub fn registry_conflict<S: Into<String>>(message: S) -> Self {
        Self::RegistryConflict {
            message: message.into(),
        }
    }

    /// Create a snapshot error
    pub fn snapshot<S: Into<String>>(message: S) -> Self {
        Self::SnapshotUnavailable {
            message: message.into(),
        }
    }

    /// Create a malformed-marker error
    pub fn marker<S: Into<String>>(message: S) -> Self {
        Self::MarkerMalformed {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a fatal invariant-violation error
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the error is recoverable by reconnecting the replication stream
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Process exit code for unrecoverable errors: 1 for fatal
    /// initialization or I/O failures, 2 for slot conflicts.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SlotInUse { .. } => 2,
            _ => 1,
        }
    }
}
