//! SQLite Backend Implementation

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row, Sqlite, TypeInfo, ValueRef};

use super::core::{DatabaseConnection, DatabaseRow, DatabaseValue};
use super::dialect::SqlDialect;
use crate::error::{MigrationError, MigrationResult};

/// SQLite connection used by the migration runner.
///
/// In-memory databases live as long as this connection.
pub struct SqliteBackend {
    conn: SqliteConnection,
}

impl SqliteBackend {
    pub async fn connect(url: &str) -> MigrationResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MigrationError::Connection(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to open SQLite database: {}", e)))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl DatabaseConnection for SqliteBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        if params.is_empty() {
            let result = Executor::execute(&mut self.conn, sql).await?;
            return Ok(result.rows_affected());
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<DatabaseRow>> {
        let rows = if params.is_empty() {
            Executor::fetch_all(&mut self.conn, sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_database_value(query, param);
            }
            query.fetch_all(&mut self.conn).await?
        };

        Ok(rows.iter().map(convert_row).collect())
    }

    async fn close(self: Box<Self>) -> MigrationResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn bind_database_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &DatabaseValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int(i) => query.bind(*i),
        DatabaseValue::Float(f) => query.bind(*f),
        DatabaseValue::Text(s) => query.bind(s.clone()),
    }
}

fn convert_row(row: &SqliteRow) -> DatabaseRow {
    let columns = row
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|index| sqlite_value_to_database_value(row, index))
        .collect();

    DatabaseRow::new(columns, values)
}

/// Convert an SQLite value to DatabaseValue using its storage class
fn sqlite_value_to_database_value(row: &SqliteRow, index: usize) -> DatabaseValue {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return DatabaseValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return DatabaseValue::Null,
    };

    let decoded = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).ok().map(DatabaseValue::Int),
        "REAL" | "NUMERIC" => row.try_get_unchecked::<f64, _>(index).ok().map(DatabaseValue::Float),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .ok()
            .map(|bytes| DatabaseValue::Text(String::from_utf8_lossy(&bytes).into_owned())),
        _ => None,
    };

    decoded
        .or_else(|| row.try_get_unchecked::<String, _>(index).ok().map(DatabaseValue::Text))
        .unwrap_or(DatabaseValue::Null)
}
