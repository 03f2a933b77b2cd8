//! Batched updates over an integer key

use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

use super::MigrationContext;

/// Half-open key range `[start, stop)`; `stop` is `None` for the last batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub start: i64,
    pub stop: Option<i64>,
}

impl BatchRange {
    /// SQL condition selecting the rows of this range
    pub fn to_sql(&self, dialect: SqlDialect, column: &str) -> String {
        let column = dialect.quote_ident(column);
        match self.stop {
            Some(stop) => format!("{column} >= {} AND {column} < {}", self.start, stop),
            None => format!("{column} >= {}", self.start),
        }
    }
}

/// Cursor yielding `BatchRange`s of `batch_size` rows over a table.
///
/// The first range starts at the lowest key; every following range starts
/// where the previous one stopped, found by skipping `batch_size` rows.
#[derive(Debug, Clone)]
pub struct EachBatch {
    table: String,
    column: String,
    batch_size: usize,
    condition: Option<String>,
    next_start: Option<i64>,
    started: bool,
    finished: bool,
}

impl EachBatch {
    pub fn new(table: impl Into<String>, batch_size: usize) -> Self {
        Self {
            table: table.into(),
            column: "id".to_string(),
            batch_size: batch_size.max(1),
            condition: None,
            next_start: None,
            started: false,
            finished: false,
        }
    }

    /// Key column to batch over, `id` by default
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Extra SQL condition rows must match
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn extra_condition(&self) -> String {
        self.condition
            .as_ref()
            .map(|c| format!(" AND ({})", c))
            .unwrap_or_default()
    }

    pub async fn next(&mut self, ctx: &mut MigrationContext) -> MigrationResult<Option<BatchRange>> {
        if self.finished {
            return Ok(None);
        }

        let table = ctx.quote(&self.table);
        let column = ctx.quote(&self.column);

        if !self.started {
            self.started = true;
            let where_clause = self
                .condition
                .as_ref()
                .map(|c| format!(" WHERE {}", c))
                .unwrap_or_default();
            let sql = format!(
                "SELECT {column} FROM {table}{where_clause} ORDER BY {column} ASC LIMIT 1"
            );
            self.next_start = key_value(ctx.select_value(&sql, &[]).await?)?;
        }

        let Some(start) = self.next_start else {
            self.finished = true;
            return Ok(None);
        };

        let sql = format!(
            "SELECT {column} FROM {table} WHERE {column} >= {}{} ORDER BY {column} ASC LIMIT 1 OFFSET {}",
            ctx.dialect().placeholder(1),
            self.extra_condition(),
            self.batch_size
        );
        let stop = key_value(ctx.select_value(&sql, &[DatabaseValue::Int(start)]).await?)?;

        match stop {
            Some(stop) => self.next_start = Some(stop),
            None => {
                self.next_start = None;
                self.finished = true;
            }
        }

        Ok(Some(BatchRange { start, stop }))
    }
}

fn key_value(value: Option<DatabaseValue>) -> MigrationResult<Option<i64>> {
    match value {
        None => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            MigrationError::InvalidArgument(format!("batch column must be an integer, got {:?}", value))
        }),
    }
}

/// Options for `update_column_in_batches`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInBatchesOptions {
    /// Defaults to 5% of the matching rows, capped at the configured maximum
    pub batch_size: Option<usize>,
    pub batch_column: String,
    pub condition: Option<String>,
}

impl Default for UpdateInBatchesOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            batch_column: "id".to_string(),
            condition: None,
        }
    }
}

impl UpdateInBatchesOptions {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn batch_column(mut self, column: impl Into<String>) -> Self {
        self.batch_column = column.into();
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// 5% of `total`, rounded up, between 1 and `max`
pub fn default_batch_size(total: u64, max: usize) -> usize {
    let five_percent = (total * 5).div_ceil(100) as usize;
    five_percent.clamp(1, max.max(1))
}

impl MigrationContext {
    /// Set `column` to the SQL expression `value_sql` in batches.
    ///
    /// Returns the number of updated rows.
    pub async fn update_column_in_batches(
        &mut self,
        table: &str,
        column: &str,
        value_sql: &str,
        options: &UpdateInBatchesOptions,
    ) -> MigrationResult<u64> {
        self.ensure_no_transaction("update_column_in_batches")?;

        let quoted_table = self.quote(table);
        let where_clause = options
            .condition
            .as_ref()
            .map(|c| format!(" WHERE {}", c))
            .unwrap_or_default();
        let total = self
            .select_count(&format!("SELECT COUNT(*) FROM {}{}", quoted_table, where_clause), &[])
            .await?;
        if total <= 0 {
            return Ok(0);
        }

        let batch_size = options
            .batch_size
            .unwrap_or_else(|| default_batch_size(total as u64, self.max_batch_size()));

        let mut batches = EachBatch::new(table, batch_size).column(options.batch_column.as_str());
        if let Some(condition) = &options.condition {
            batches = batches.condition(condition.as_str());
        }

        let extra = options
            .condition
            .as_ref()
            .map(|c| format!(" AND ({})", c))
            .unwrap_or_default();
        let quoted_column = self.quote(column);

        let mut updated = 0;
        let mut batch = 0;
        while let Some(range) = batches.next(self).await? {
            batch += 1;
            let sql = format!(
                "UPDATE {} SET {} = {} WHERE {}{}",
                quoted_table,
                quoted_column,
                value_sql,
                range.to_sql(self.dialect(), &options.batch_column),
                extra
            );
            let affected = self.execute(&sql).await?;
            tracing::debug!(table, column, batch, start = range.start, stop = ?range.stop, affected, "updated batch");
            updated += affected;
        }

        tracing::info!(table, column, batches = batch, updated, "batched update finished");
        Ok(updated)
    }

    /// Delete rows sharing a non-null `columns` tuple, keeping the highest `id`.
    ///
    /// Returns the number of deleted rows.
    pub async fn remove_duplicates(&mut self, table: &str, columns: &[&str]) -> MigrationResult<u64> {
        if columns.is_empty() {
            return Err(MigrationError::InvalidArgument(
                "remove_duplicates requires at least one column".to_string(),
            ));
        }

        let quoted_table = self.quote(table);
        let not_null = columns
            .iter()
            .map(|c| format!("{}.{} IS NOT NULL", quoted_table, self.quote(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let same_tuple = columns
            .iter()
            .map(|c| {
                let column = self.quote(c);
                format!("duplicates.{column} = {quoted_table}.{column}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "DELETE FROM {quoted_table} WHERE {not_null} AND EXISTS (\
             SELECT 1 FROM {quoted_table} duplicates WHERE {same_tuple} \
             AND duplicates.id > {quoted_table}.id)"
        );
        let deleted = self.execute(&sql).await?;
        tracing::info!(table, columns = %columns.join(", "), deleted, "removed duplicate rows");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::sqlite_context;

    async fn seeded(rows: i64) -> MigrationContext {
        let mut ctx = sqlite_context().await;
        ctx.execute("CREATE TABLE snippets (id INTEGER PRIMARY KEY, private INTEGER, visibility_level INTEGER)")
            .await
            .unwrap();
        for id in 1..=rows {
            ctx.execute_with(
                "INSERT INTO snippets (id, private) VALUES (?1, ?2)",
                &[DatabaseValue::Int(id * 2), DatabaseValue::Int(id % 2)],
            )
            .await
            .unwrap();
        }
        ctx
    }

    #[test]
    fn test_default_batch_size() {
        assert_eq!(default_batch_size(1, 1000), 1);
        assert_eq!(default_batch_size(30, 1000), 2);
        assert_eq!(default_batch_size(100, 1000), 5);
        assert_eq!(default_batch_size(1_000_000, 1000), 1000);
        assert_eq!(default_batch_size(1_000_000, 0), 1);
    }

    #[test]
    fn test_batch_range_sql() {
        let range = BatchRange { start: 4, stop: Some(10) };
        assert_eq!(range.to_sql(SqlDialect::PostgreSQL, "id"), "\"id\" >= 4 AND \"id\" < 10");
        let last = BatchRange { start: 10, stop: None };
        assert_eq!(last.to_sql(SqlDialect::SQLite, "id"), "\"id\" >= 10");
    }

    #[tokio::test]
    async fn test_each_batch_covers_table() {
        let mut ctx = seeded(7).await;
        let mut batches = EachBatch::new("snippets", 3);

        let mut ranges = Vec::new();
        while let Some(range) = batches.next(&mut ctx).await.unwrap() {
            ranges.push(range);
        }

        assert_eq!(
            ranges,
            vec![
                BatchRange { start: 2, stop: Some(8) },
                BatchRange { start: 8, stop: Some(14) },
                BatchRange { start: 14, stop: None },
            ]
        );
        assert!(batches.next(&mut ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_each_batch_empty_table() {
        let mut ctx = seeded(0).await;
        let mut batches = EachBatch::new("snippets", 10).condition("private = 1");
        assert!(batches.next(&mut ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_column_in_batches() {
        let mut ctx = seeded(25).await;

        let options = UpdateInBatchesOptions::default().condition("private = 1");
        let updated = ctx
            .update_column_in_batches("snippets", "visibility_level", "0", &options)
            .await
            .unwrap();
        assert_eq!(updated, 13);

        let options = UpdateInBatchesOptions::default()
            .batch_size(4)
            .condition("private = 0");
        let updated = ctx
            .update_column_in_batches("snippets", "visibility_level", "10", &options)
            .await
            .unwrap();
        assert_eq!(updated, 12);

        assert_eq!(
            ctx.select_count("SELECT COUNT(*) FROM snippets WHERE visibility_level IS NULL", &[])
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            ctx.select_count("SELECT COUNT(*) FROM snippets WHERE visibility_level = 10", &[])
                .await
                .unwrap(),
            12
        );
    }

    #[tokio::test]
    async fn test_update_column_in_batches_nothing_to_do() {
        let mut ctx = seeded(3).await;
        let options = UpdateInBatchesOptions::default().condition("private = 7");
        assert_eq!(
            ctx.update_column_in_batches("snippets", "visibility_level", "0", &options)
                .await
                .unwrap(),
            0
        );

        ctx.begin().await.unwrap();
        let err = ctx
            .update_column_in_batches("snippets", "visibility_level", "0", &UpdateInBatchesOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TransactionOpen { .. }));
        ctx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_duplicates_keeps_highest_id() {
        let mut ctx = sqlite_context().await;
        ctx.execute(
            "CREATE TABLE ci_variables (id INTEGER PRIMARY KEY, project_id INTEGER, key TEXT, value TEXT)",
        )
        .await
        .unwrap();
        ctx.execute(
            "INSERT INTO ci_variables (id, project_id, key, value) VALUES \
             (1, 1, 'TOKEN', 'old'), (2, 1, 'TOKEN', 'mid'), (3, 1, 'TOKEN', 'new'), \
             (4, 2, 'TOKEN', 'other'), (5, NULL, 'TOKEN', 'a'), (6, NULL, 'TOKEN', 'b')",
        )
        .await
        .unwrap();

        let deleted = ctx
            .remove_duplicates("ci_variables", &["project_id", "key"])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let ids: Vec<i64> = ctx
            .select_all("SELECT id FROM ci_variables ORDER BY id", &[])
            .await
            .unwrap()
            .iter()
            .filter_map(|row| row.get_i64("id"))
            .collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }
}
