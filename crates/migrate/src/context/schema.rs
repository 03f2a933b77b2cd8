//! Schema change helpers

use crate::error::{MigrationError, MigrationResult};
use crate::migrations::schema_builder::{
    column_definition_sql, create_index_sql, drop_index_sql, ColumnOptions, ColumnType, DefaultValue,
    IndexOptions, TableBuilder,
};

use super::MigrationContext;

/// Timestamp columns `add_timestamps_with_timezone` may create
pub const PERMITTED_TIMESTAMP_COLUMNS: [&str; 3] = ["created_at", "updated_at", "deleted_at"];
/// Columns created when none are given
pub const DEFAULT_TIMESTAMP_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// Options for `add_timestamps_with_timezone` and `remove_timestamps`
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampOptions {
    pub columns: Vec<String>,
    /// Columns are `NOT NULL` unless this is set
    pub null: bool,
    pub default: Option<DefaultValue>,
}

impl Default for TimestampOptions {
    fn default() -> Self {
        Self {
            columns: DEFAULT_TIMESTAMP_COLUMNS.iter().map(|c| c.to_string()).collect(),
            null: false,
            default: None,
        }
    }
}

impl TimestampOptions {
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }
}

fn validate_timestamp_column_name(column: &str) -> MigrationResult<()> {
    if PERMITTED_TIMESTAMP_COLUMNS.contains(&column) {
        return Ok(());
    }
    Err(MigrationError::InvalidArgument(format!(
        "Illegal timestamp column name! Got {}. Must be one of: {}",
        column,
        PERMITTED_TIMESTAMP_COLUMNS.join(", ")
    )))
}

impl MigrationContext {
    /// Create a table declared with a `TableBuilder`
    pub async fn create_table<F>(&mut self, table: &str, build: F) -> MigrationResult<()>
    where
        F: FnOnce(&mut TableBuilder) + Send,
    {
        let mut builder = TableBuilder::new(table);
        build(&mut builder);

        for statement in builder.to_sql(self.dialect()) {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    pub async fn drop_table(&mut self, table: &str) -> MigrationResult<()> {
        let sql = format!("DROP TABLE {}", self.quote(table));
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn add_column(
        &mut self,
        table: &str,
        column: &str,
        column_type: ColumnType,
        options: ColumnOptions,
    ) -> MigrationResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote(table),
            column_definition_sql(self.dialect(), column, &column_type, &options)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn remove_column(&mut self, table: &str, column: &str) -> MigrationResult<()> {
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote(table),
            self.quote(column)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> MigrationResult<()> {
        let sql = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote(table),
            self.quote(from),
            self.quote(to)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    /// Set or drop (`None`) a column default
    pub async fn change_column_default(
        &mut self,
        table: &str,
        column: &str,
        default: Option<DefaultValue>,
    ) -> MigrationResult<()> {
        if !self.dialect().supports_alter_constraints() {
            return Err(MigrationError::unsupported("change_column_default", self.dialect()));
        }

        let action = match default {
            Some(value) => format!("SET DEFAULT {}", value.to_sql(self.dialect())),
            None => "DROP DEFAULT".to_string(),
        };
        let sql = format!(
            "ALTER TABLE {} ALTER COLUMN {} {}",
            self.quote(table),
            self.quote(column),
            action
        );
        self.execute(&sql).await?;
        Ok(())
    }

    /// Create an index inside the current transaction, if any
    pub async fn add_index(&mut self, table: &str, columns: &[&str], options: &IndexOptions) -> MigrationResult<()> {
        let sql = create_index_sql(self.dialect(), table, columns, options, false);
        self.execute(&sql).await?;
        Ok(())
    }

    pub async fn remove_index_by_name(&mut self, index: &str) -> MigrationResult<()> {
        let sql = drop_index_sql(self.dialect(), index, false);
        self.execute(&sql).await?;
        Ok(())
    }

    /// Add `created_at`/`updated_at` (or the given columns) with time zone.
    ///
    /// Only `created_at`, `updated_at` and `deleted_at` are permitted. A
    /// default value requires running outside a transaction.
    pub async fn add_timestamps_with_timezone(
        &mut self,
        table: &str,
        options: &TimestampOptions,
    ) -> MigrationResult<()> {
        if options.default.is_some() {
            self.ensure_no_transaction("add_timestamps_with_timezone with default value")?;
        }

        for column in &options.columns {
            validate_timestamp_column_name(column)?;
        }

        for column in &options.columns {
            let column_options = ColumnOptions {
                null: options.null,
                default: options.default.clone(),
            };
            self.add_column(table, column, ColumnType::DateTimeWithTimezone, column_options)
                .await?;
        }
        Ok(())
    }

    /// Remove timestamp columns added by `add_timestamps_with_timezone`
    pub async fn remove_timestamps(&mut self, table: &str, options: &TimestampOptions) -> MigrationResult<()> {
        for column in &options.columns {
            self.remove_column(table, column).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::sqlite_context;

    #[tokio::test]
    async fn test_table_and_column_changes() {
        let mut ctx = sqlite_context().await;
        ctx.create_table("snippets", |t| {
            t.id();
            t.string("title", Some(255)).not_null();
            t.boolean("private").not_null().default_value(true);
        })
        .await
        .unwrap();

        ctx.add_column(
            "snippets",
            "visibility_level",
            ColumnType::Integer,
            ColumnOptions::new().not_null().default_value(0),
        )
        .await
        .unwrap();
        ctx.rename_column("snippets", "title", "name").await.unwrap();
        ctx.add_index("snippets", &["visibility_level"], &IndexOptions::new())
            .await
            .unwrap();

        let columns: Vec<String> = ctx
            .columns("snippets")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(columns, vec!["id", "name", "private", "visibility_level"]);
        assert!(ctx
            .index_exists_by_name("snippets", "index_snippets_on_visibility_level")
            .await
            .unwrap());

        ctx.remove_index_by_name("index_snippets_on_visibility_level").await.unwrap();
        ctx.remove_column("snippets", "visibility_level").await.unwrap();
        assert!(!ctx.column_exists("snippets", "visibility_level").await.unwrap());

        ctx.drop_table("snippets").await.unwrap();
        assert!(!ctx.table_exists("snippets").await.unwrap());
    }

    #[tokio::test]
    async fn test_timestamps_with_timezone() {
        let mut ctx = sqlite_context().await;
        ctx.execute("CREATE TABLE ci_variables (id INTEGER PRIMARY KEY)").await.unwrap();

        ctx.add_timestamps_with_timezone("ci_variables", &TimestampOptions::default().nullable())
            .await
            .unwrap();
        assert!(ctx.column_exists("ci_variables", "created_at").await.unwrap());
        assert_eq!(
            ctx.column_is_nullable("ci_variables", "updated_at").await.unwrap(),
            Some(true)
        );

        let illegal = TimestampOptions::default().columns(&["published_at"]);
        let err = ctx
            .add_timestamps_with_timezone("ci_variables", &illegal)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArgument(_)));
        assert!(!ctx.column_exists("ci_variables", "published_at").await.unwrap());

        ctx.remove_timestamps("ci_variables", &TimestampOptions::default())
            .await
            .unwrap();
        assert!(!ctx.column_exists("ci_variables", "created_at").await.unwrap());
    }

    #[tokio::test]
    async fn test_change_column_default_unsupported_on_sqlite() {
        let mut ctx = sqlite_context().await;
        let err = ctx
            .change_column_default("t", "c", Some(DefaultValue::Int(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Unsupported { .. }));
    }
}
