//! Error types for dbkit.
//!
//! All failures surface as a single [`DbError`] enum built with `thiserror`.
//! Every variant carries enough context (operation, identifier) for the
//! caller to decide between retry and abort; nothing is swallowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("connection failed: {message}")]
    Connect { message: String },

    #[error("pool exhausted: no connection became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("timed out after {elapsed_ms}ms during {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("pool is closed")]
    PoolClosed,

    #[error(
        "checksum mismatch for change-set '{change_set_id}': ledger records {recorded}, authored change-set computes {computed}"
    )]
    ChecksumMismatch {
        change_set_id: String,
        recorded: String,
        computed: String,
    },

    #[error("migration of change-set '{change_set_id}' failed: {cause}")]
    MigrationFailed {
        change_set_id: String,
        #[source]
        cause: Box<DbError>,
    },

    #[error("statement failed: {message}")]
    Statement {
        message: String,
        /// e.g. "23505" for a PostgreSQL unique violation
        sql_state: Option<String>,
    },

    #[error("parameter count mismatch: statement expects {expected}, {supplied} supplied")]
    ParamBinding { expected: usize, supplied: usize },

    #[error("batch failed at parameter set {index}: {cause}")]
    Batch {
        /// Zero-based index of the parameter set that failed.
        index: usize,
        /// Affected-row counts for the sets that completed (and, in
        /// autocommit mode, committed) before the failure.
        completed: Vec<u64>,
        #[source]
        cause: Box<DbError>,
    },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl DbError {
    /// Create a connection error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a pool-exhausted error from the observed wait.
    pub fn pool_exhausted(waited: std::time::Duration) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a checksum mismatch error.
    pub fn checksum_mismatch(
        change_set_id: impl Into<String>,
        recorded: impl Into<String>,
        computed: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            change_set_id: change_set_id.into(),
            recorded: recorded.into(),
            computed: computed.into(),
        }
    }

    /// Wrap a failure that aborted a migration run.
    pub fn migration_failed(change_set_id: impl Into<String>, cause: DbError) -> Self {
        Self::MigrationFailed {
            change_set_id: change_set_id.into(),
            cause: Box::new(cause),
        }
    }

    /// Create a statement error with optional SQLSTATE.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a parameter binding error.
    pub fn param_binding(expected: usize, supplied: usize) -> Self {
        Self::ParamBinding { expected, supplied }
    }

    /// Wrap a failure of one parameter set within a batch.
    pub fn batch(index: usize, completed: Vec<u64>, cause: DbError) -> Self {
        Self::Batch {
            index,
            completed,
            cause: Box::new(cause),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::PoolExhausted { .. } | Self::Timeout { .. }
        )
    }

    /// Check if this error signals a ledger unique-key conflict.
    ///
    /// Matched by SQLSTATE where the driver reports one (PostgreSQL 23505,
    /// MySQL 1062/23000) and by message for SQLite.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Statement {
                sql_state: Some(state),
                ..
            } if state == "23505" || state == "1062" || state == "23000" => true,
            Self::Statement { message, .. } => message.contains("UNIQUE constraint"),
            _ => false,
        }
    }

    /// Check if this error means the connection itself can no longer be
    /// trusted and must not be recycled.
    ///
    /// A statement timeout counts: the in-flight query was cancelled
    /// mid-protocol, leaving the wire in an unknown state.
    pub fn indicates_broken_connection(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                DbError::statement(db_err.message(), sql_state)
            }
            sqlx::Error::RowNotFound => DbError::statement("no rows returned", None),
            sqlx::Error::Io(io_err) => DbError::connect(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connect(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::connect(format!("protocol error: {}", msg)),
            sqlx::Error::WorkerCrashed => DbError::connect("database worker crashed"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                // sqlx's own pool is not used here; these only appear if a
                // caller feeds us an error from elsewhere.
                DbError::connect(err.to_string())
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::statement(format!("column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::statement(
                format!("column index {} out of bounds (len: {})", index, len),
                None,
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::statement(
                format!("failed to decode column {}: {}", index, source),
                None,
            ),
            sqlx::Error::Decode(source) => {
                DbError::statement(format!("decode error: {}", source), None)
            }
            _ => DbError::statement(format!("database error: {}", err), None),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
