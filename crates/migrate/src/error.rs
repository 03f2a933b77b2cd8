//! Error types for migration execution
//!
//! Driver errors are classified on conversion so that lock and statement
//! timeouts can be told apart from other database failures.

use thiserror::Error;

use crate::backends::SqlDialect;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// PostgreSQL `lock_not_available`
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// PostgreSQL `query_canceled`, raised when `statement_timeout` fires
const PG_QUERY_CANCELED: &str = "57014";
/// SQLite `SQLITE_BUSY` and `SQLITE_LOCKED` primary result codes
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Statement timeout: {0}")]
    StatementTimeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("`{operation}` is not supported on {dialect}")]
    Unsupported { operation: String, dialect: SqlDialect },

    #[error(
        "`{helper}` cannot be run inside a transaction. \
         Disable the DDL transaction for this migration (ddl_transaction() -> false)"
    )]
    TransactionOpen { helper: String },

    #[error("`{operation}` requires an open transaction")]
    NoTransaction { operation: String },

    #[error(
        "Could not find {kind} \"{name}\" on table \"{table}\" which was referenced during the migration. \
         This issue could be caused by the database schema straying from the expected state. \
         Verify that all previous migrations have completed and that the database objects \
         used in this migration match the expected schema"
    )]
    MissingSchemaObject {
        table: String,
        kind: String,
        name: String,
    },

    #[error("Migration {version} ({name}) is irreversible")]
    Irreversible { version: i64, name: String },

    #[error("Migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        version: i64,
        name: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("Unknown migration version {0}")]
    UnknownVersion(i64),

    #[error("Migration {0} is already applied")]
    AlreadyApplied(i64),

    #[error("Migration {0} is not applied")]
    NotApplied(i64),

    #[error("No migration defines applied version {0}")]
    MissingMigration(i64),

    #[error("Could not acquire the lock after {attempts} attempts")]
    LockRetriesExhausted { attempts: usize },

    #[error("Another migration process is currently running")]
    ConcurrentMigration,

    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    #[error("Invalid ledger entry: {0}")]
    InvalidLedger(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] tidemark_core::ConfigError),
}

impl MigrationError {
    pub fn unsupported(operation: impl Into<String>, dialect: SqlDialect) -> Self {
        MigrationError::Unsupported {
            operation: operation.into(),
            dialect,
        }
    }

    pub fn transaction_open(helper: impl Into<String>) -> Self {
        MigrationError::TransactionOpen {
            helper: helper.into(),
        }
    }

    pub fn missing_schema_object(
        table: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        MigrationError::MissingSchemaObject {
            table: table.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether this error means a lock could not be acquired in time
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, MigrationError::LockTimeout(_))
    }

    /// The innermost error, looking through `MigrationFailed` wrappers
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::MigrationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let sqlite = db_err.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some();
                classify_database_error(
                    db_err.code().map(|c| c.to_string()),
                    db_err.message().to_string(),
                    sqlite,
                )
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                MigrationError::Connection(err.to_string())
            }
            _ => MigrationError::Database {
                code: None,
                message: err.to_string(),
            },
        }
    }
}

/// Map a driver error code onto the timeout variants the lock retry loop reacts to.
///
/// SQLite reports extended result codes (`SQLITE_BUSY_SNAPSHOT` is 517,
/// `SQLITE_LOCKED_SHAREDCACHE` is 262); the low byte is the primary code.
fn classify_database_error(code: Option<String>, message: String, sqlite: bool) -> MigrationError {
    if sqlite {
        let primary = code.as_deref().and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff);
        return match primary {
            Some(SQLITE_BUSY | SQLITE_LOCKED) => MigrationError::LockTimeout(message),
            _ => MigrationError::Database { code, message },
        };
    }

    match code.as_deref() {
        Some(PG_LOCK_NOT_AVAILABLE) => MigrationError::LockTimeout(message),
        Some(PG_QUERY_CANCELED) => MigrationError::StatementTimeout(message),
        _ => MigrationError::Database { code, message },
    }
}
