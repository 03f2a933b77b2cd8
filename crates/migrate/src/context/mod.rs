//! Migration context
//!
//! `MigrationContext` owns the migration connection and exposes the helpers
//! migrations are written with: raw SQL, transactions, catalog
//! introspection, schema changes, concurrent index and constraint helpers,
//! lock retries, batched updates and index repair.

pub mod batching;
pub mod concurrent;
pub mod constraints;
pub mod introspection;
pub mod lock_retries;
pub mod repair_index;
pub mod schema;

use std::future::Future;
use std::pin::Pin;

use tidemark_core::{LockRetriesConfig, TidemarkConfig};

use crate::backends::{self, DatabaseConnection, DatabaseRow, DatabaseValue, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

pub use batching::{BatchRange, EachBatch, UpdateInBatchesOptions};
pub use concurrent::ForeignKeyOptions;
pub use constraints::{check_constraint_name, concurrent_foreign_key_name};
pub use introspection::{ColumnInfo, ForeignKeyFilter, ForeignKeyInfo, IndexInfo};
pub use lock_retries::{LockRetryOptions, LockRetryTiming};
pub use repair_index::{
    DuplicateAction, IndexReference, IndexRepair, IndexRepairAction, IndexRepairReport, ReferenceKind,
};
pub use schema::{TimestampOptions, PERMITTED_TIMESTAMP_COLUMNS};

/// Boxed future returned by helper blocks
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Connection plus session state for a migration run
pub struct MigrationContext {
    conn: Box<dyn DatabaseConnection>,
    dialect: SqlDialect,
    transaction_open: bool,
    statement_timeout_disabled: bool,
    lock_retries: LockRetriesConfig,
    max_batch_size: usize,
}

impl MigrationContext {
    pub fn new(conn: Box<dyn DatabaseConnection>) -> Self {
        let dialect = conn.dialect();
        Self {
            conn,
            dialect,
            transaction_open: false,
            statement_timeout_disabled: false,
            lock_retries: LockRetriesConfig::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Connect to the configured database and apply the helper settings
    pub async fn connect(config: &TidemarkConfig) -> MigrationResult<Self> {
        let url = config.database_url()?;
        let conn = backends::connect(&url).await?;
        Ok(Self::new(conn).with_config(config))
    }

    pub fn with_config(mut self, config: &TidemarkConfig) -> Self {
        self.lock_retries = config.lock_retries.clone();
        self.max_batch_size = config.batching.max_batch_size;
        self
    }

    pub fn with_lock_retries_config(mut self, config: LockRetriesConfig) -> Self {
        self.lock_retries = config;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn lock_retries_config(&self) -> &LockRetriesConfig {
        &self.lock_retries
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Quote an identifier for this connection's dialect
    pub fn quote(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    pub fn true_value(&self) -> &'static str {
        self.dialect.true_value()
    }

    pub fn false_value(&self) -> &'static str {
        self.dialect.false_value()
    }

    /// Execute raw SQL; may contain several statements
    pub async fn execute(&mut self, sql: &str) -> MigrationResult<u64> {
        tracing::debug!(sql = %sql, "execute");
        self.conn.execute(sql, &[]).await
    }

    /// Execute a statement with bound parameters
    pub async fn execute_with(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        tracing::debug!(sql = %sql, params = params.len(), "execute");
        self.conn.execute(sql, params).await
    }

    pub async fn select_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<DatabaseRow>> {
        tracing::debug!(sql = %sql, params = params.len(), "select");
        self.conn.fetch_all(sql, params).await
    }

    /// First column of the first row
    pub async fn select_value(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<DatabaseValue>> {
        let rows = self.select_all(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.get_by_index(0).cloned())
            .filter(|value| !value.is_null()))
    }

    /// Integer result of a `COUNT(*)`-style query; no rows count as zero
    pub async fn select_count(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<i64> {
        match self.select_value(sql, params).await? {
            None => Ok(0),
            Some(value) => value.as_i64().ok_or_else(|| MigrationError::Database {
                code: None,
                message: format!("expected an integer count, got {:?}", value),
            }),
        }
    }

    pub fn transaction_open(&self) -> bool {
        self.transaction_open
    }

    pub async fn begin(&mut self) -> MigrationResult<()> {
        if self.transaction_open {
            return Err(MigrationError::transaction_open("begin"));
        }
        self.execute("BEGIN").await?;
        self.transaction_open = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> MigrationResult<()> {
        if !self.transaction_open {
            return Err(MigrationError::NoTransaction {
                operation: "commit".to_string(),
            });
        }
        let result = self.execute("COMMIT").await;
        self.transaction_open = false;
        result.map(|_| ())
    }

    pub async fn rollback(&mut self) -> MigrationResult<()> {
        if !self.transaction_open {
            return Err(MigrationError::NoTransaction {
                operation: "rollback".to_string(),
            });
        }
        let result = self.execute("ROLLBACK").await;
        self.transaction_open = false;
        result.map(|_| ())
    }

    /// Roll back an open transaction after a failure, keeping the original error
    pub(crate) async fn rollback_after_error(&mut self, error: MigrationError) -> MigrationError {
        if self.transaction_open {
            if let Err(rollback_error) = self.rollback().await {
                tracing::error!(error = %rollback_error, "rollback failed");
            }
        }
        error
    }

    pub(crate) fn ensure_no_transaction(&self, helper: &str) -> MigrationResult<()> {
        if self.transaction_open {
            return Err(MigrationError::transaction_open(helper));
        }
        Ok(())
    }

    pub fn statement_timeout_disabled(&self) -> bool {
        self.statement_timeout_disabled
    }

    /// Run `block` with `statement_timeout` disabled.
    ///
    /// Outside a transaction the setting is applied to the session and
    /// `RESET ALL` runs afterwards; inside one it uses `SET LOCAL`. Nested
    /// calls leave the outer call in charge of the reset.
    pub async fn disable_statement_timeout<T, F>(&mut self, block: F) -> MigrationResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut MigrationContext) -> BoxFuture<'c, MigrationResult<T>> + Send,
    {
        if !self.dialect.supports_statement_timeout() || self.statement_timeout_disabled {
            return block(self).await;
        }

        if self.transaction_open {
            self.execute("SET LOCAL statement_timeout TO 0").await?;
            self.statement_timeout_disabled = true;
            let result = block(self).await;
            self.statement_timeout_disabled = false;
            return result;
        }

        self.execute("SET statement_timeout TO 0").await?;
        self.statement_timeout_disabled = true;
        let result = block(self).await;
        self.statement_timeout_disabled = false;

        let reset = self.execute("RESET ALL").await;
        let value = result?;
        reset?;
        Ok(value)
    }

    /// Close the underlying connection
    pub async fn close(self) -> MigrationResult<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::MigrationContext;
    use crate::backends::{connect, DatabaseConnection, DatabaseRow, DatabaseValue, SqlDialect};
    use crate::error::{MigrationError, MigrationResult};

    pub async fn sqlite_context() -> MigrationContext {
        let conn = connect("sqlite::memory:").await.unwrap();
        MigrationContext::new(conn)
    }

    /// SQL seen by a `RecordingConnection`, shared with the test
    #[derive(Debug, Clone, Default)]
    pub struct StatementLog(Arc<Mutex<Vec<String>>>);

    impl StatementLog {
        fn push(&self, sql: &str) {
            self.0.lock().unwrap().push(sql.to_string());
        }

        pub fn statements(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    /// PostgreSQL stand-in: records every statement and answers queries
    /// from a script, so session-level SQL can be asserted exactly
    #[derive(Default)]
    pub struct RecordingConnection {
        executed: StatementLog,
        queried: StatementLog,
        lock_timeouts: Vec<(String, usize)>,
        answers: Vec<(String, Vec<DatabaseRow>)>,
    }

    impl RecordingConnection {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `times` statements containing `fragment` with a lock timeout
        pub fn lock_timeout_on(mut self, fragment: &str, times: usize) -> Self {
            self.lock_timeouts.push((fragment.to_string(), times));
            self
        }

        /// Answer queries containing `fragment` with one single-column row
        pub fn answer(self, fragment: &str, value: DatabaseValue) -> Self {
            self.answer_rows(fragment, vec![DatabaseRow::new(vec!["value".to_string()], vec![value])])
        }

        pub fn answer_rows(mut self, fragment: &str, rows: Vec<DatabaseRow>) -> Self {
            self.answers.push((fragment.to_string(), rows));
            self
        }

        /// Statements sent through `execute`
        pub fn executed(&self) -> StatementLog {
            self.executed.clone()
        }

        /// Statements sent through `fetch_all`
        pub fn queried(&self) -> StatementLog {
            self.queried.clone()
        }

        pub fn into_context(self) -> MigrationContext {
            MigrationContext::new(Box::new(self))
        }
    }

    #[async_trait]
    impl DatabaseConnection for RecordingConnection {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::PostgreSQL
        }

        async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> MigrationResult<u64> {
            self.executed.push(sql);
            let failing = self
                .lock_timeouts
                .iter_mut()
                .find(|(fragment, remaining)| *remaining > 0 && sql.contains(fragment.as_str()));
            if let Some((_, remaining)) = failing {
                *remaining -= 1;
                return Err(MigrationError::LockTimeout(
                    "canceling statement due to lock timeout".to_string(),
                ));
            }
            Ok(0)
        }

        async fn fetch_all(&mut self, sql: &str, _params: &[DatabaseValue]) -> MigrationResult<Vec<DatabaseRow>> {
            self.queried.push(sql);
            Ok(self
                .answers
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        }

        async fn close(self: Box<Self>) -> MigrationResult<()> {
            Ok(())
        }
    }
}
