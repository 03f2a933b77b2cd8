//! Core Database Backend Traits
//!
//! The migration runner talks to the database through a single dedicated
//! connection. Session state (lock and statement timeouts, advisory locks,
//! the open transaction) lives on that connection, so the abstraction is a
//! connection rather than a pool.

use async_trait::async_trait;

use super::dialect::SqlDialect;
use crate::error::MigrationResult;

/// Abstract database connection used by migrations
#[async_trait]
pub trait DatabaseConnection: Send {
    /// SQL dialect spoken by this connection
    fn dialect(&self) -> SqlDialect;

    /// Execute a statement and return the affected row count.
    ///
    /// Without parameters the statement is sent as-is, so `sql` may hold
    /// several statements separated by semicolons.
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64>;

    /// Execute a query and return every result row
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<DatabaseRow>>;

    /// Close the connection
    async fn close(self: Box<Self>) -> MigrationResult<()>;
}

/// Database value enumeration for parameter binding and result decoding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Integer view of the value; text is parsed, booleans map to 0/1
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int(i) => Some(*i),
            DatabaseValue::Bool(b) => Some(i64::from(*b)),
            DatabaseValue::Text(s) => s.trim().parse().ok(),
            DatabaseValue::Float(_) | DatabaseValue::Null => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(b) => Some(*b),
            DatabaseValue::Int(i) => Some(*i != 0),
            DatabaseValue::Text(s) => match s.to_lowercase().as_str() {
                "t" | "true" | "1" | "yes" | "y" => Some(true),
                "f" | "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            },
            DatabaseValue::Float(_) | DatabaseValue::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as an SQL literal for the given dialect
    pub fn to_sql_literal(&self, dialect: SqlDialect) -> String {
        match self {
            DatabaseValue::Null => "NULL".to_string(),
            DatabaseValue::Bool(true) => dialect.true_value().to_string(),
            DatabaseValue::Bool(false) => dialect.false_value().to_string(),
            DatabaseValue::Int(i) => i.to_string(),
            DatabaseValue::Float(f) => f.to_string(),
            DatabaseValue::Text(s) => dialect.quote_literal(s),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int(i64::from(value))
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::Text(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::Text(value.to_string())
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A decoded result row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&DatabaseValue> {
        self.values.get(index)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(DatabaseValue::as_i64)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(DatabaseValue::as_bool)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(DatabaseValue::as_str)
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[DatabaseValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
