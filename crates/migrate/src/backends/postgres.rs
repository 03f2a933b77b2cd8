//! PostgreSQL Backend Implementation
//!
//! A single `sqlx::PgConnection`. Parameterless statements go through the
//! simple query protocol, which allows `CREATE INDEX CONCURRENTLY` and
//! multi-statement strings.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Postgres, Row, TypeInfo, ValueRef};

use super::core::{DatabaseConnection, DatabaseRow, DatabaseValue};
use super::dialect::SqlDialect;
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL connection used by the migration runner
pub struct PostgresBackend {
    conn: PgConnection,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> MigrationResult<Self> {
        let conn = PgConnection::connect(url)
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to connect to PostgreSQL: {}", e)))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl DatabaseConnection for PostgresBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
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
    query: Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int(i) => query.bind(*i),
        DatabaseValue::Float(f) => query.bind(*f),
        DatabaseValue::Text(s) => query.bind(s.clone()),
    }
}

fn convert_row(row: &PgRow) -> DatabaseRow {
    let columns = row
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|index| postgres_value_to_database_value(row, index))
        .collect();

    DatabaseRow::new(columns, values)
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> DatabaseValue {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return DatabaseValue::Null,
        Err(_) => return DatabaseValue::Null,
        Ok(_) => {}
    }

    let type_name = row.columns()[index].type_info().name().to_string();

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get_unchecked::<bool, _>(index).ok().map(DatabaseValue::Bool),
        "INT2" => row
            .try_get_unchecked::<i16, _>(index)
            .ok()
            .map(|v| DatabaseValue::Int(i64::from(v))),
        "INT4" => row
            .try_get_unchecked::<i32, _>(index)
            .ok()
            .map(|v| DatabaseValue::Int(i64::from(v))),
        "INT8" => row.try_get_unchecked::<i64, _>(index).ok().map(DatabaseValue::Int),
        "FLOAT4" => row
            .try_get_unchecked::<f32, _>(index)
            .ok()
            .map(|v| DatabaseValue::Float(f64::from(v))),
        "FLOAT8" => row.try_get_unchecked::<f64, _>(index).ok().map(DatabaseValue::Float),
        "TIMESTAMP" => row
            .try_get_unchecked::<chrono::NaiveDateTime, _>(index)
            .ok()
            .map(|v| DatabaseValue::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => row
            .try_get_unchecked::<chrono::DateTime<chrono::Utc>, _>(index)
            .ok()
            .map(|v| DatabaseValue::Text(v.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        _ => None,
    };

    decoded
        .or_else(|| row.try_get::<String, _>(index).ok().map(DatabaseValue::Text))
        .or_else(|| row.try_get_unchecked::<String, _>(index).ok().map(DatabaseValue::Text))
        .unwrap_or(DatabaseValue::Null)
}
