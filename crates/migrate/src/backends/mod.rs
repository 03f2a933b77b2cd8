//! Database Backend Abstractions
//!
//! One dedicated connection per migration run, for PostgreSQL or SQLite.

pub mod core;
pub mod dialect;
pub mod postgres;
pub mod sqlite;

pub use self::core::{DatabaseConnection, DatabaseRow, DatabaseValue};
pub use dialect::SqlDialect;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::error::{MigrationError, MigrationResult};

/// Open a connection, choosing the backend from the URL scheme
pub async fn connect(url: &str) -> MigrationResult<Box<dyn DatabaseConnection>> {
    match backend_for_url(url) {
        Some(SqlDialect::PostgreSQL) => Ok(Box::new(PostgresBackend::connect(url).await?)),
        Some(SqlDialect::SQLite) => Ok(Box::new(SqliteBackend::connect(url).await?)),
        None => Err(MigrationError::Connection(format!(
            "Unsupported database URL scheme: {}",
            redact_url(url)
        ))),
    }
}

/// Dialect implied by a database URL, if it is one we support
pub fn backend_for_url(url: &str) -> Option<SqlDialect> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Some(SqlDialect::PostgreSQL)
    } else if url.starts_with("sqlite:") {
        Some(SqlDialect::SQLite)
    } else {
        None
    }
}

/// Scheme only, so credentials never reach error messages or logs
fn redact_url(url: &str) -> String {
    match url.split_once(':') {
        Some((scheme, _)) => format!("{}:...", scheme),
        None => "<invalid url>".to_string(),
    }
}
