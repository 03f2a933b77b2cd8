//! Concurrent index and foreign key helpers
//!
//! These helpers must run with the DDL transaction disabled. Each one checks
//! the catalog first and logs a warning instead of failing when the object
//! is already in the requested state, so an aborted migration can be re-run.

use crate::error::{MigrationError, MigrationResult};
use crate::migrations::schema_builder::{create_index_sql, drop_index_sql, IndexOptions, OnDelete};

use super::constraints::concurrent_foreign_key_name;
use super::introspection::ForeignKeyFilter;
use super::MigrationContext;

const FOREIGN_KEY_PREFIX: &str = "fk_";

/// Options for `add_concurrent_foreign_key`
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyOptions {
    pub column: String,
    pub on_delete: Option<OnDelete>,
    /// Defaults to `concurrent_foreign_key_name(source, column, "fk_")`
    pub name: Option<String>,
    pub validate: bool,
}

impl ForeignKeyOptions {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            on_delete: Some(OnDelete::Cascade),
            name: None,
            validate: true,
        }
    }

    pub fn on_delete(mut self, on_delete: Option<OnDelete>) -> Self {
        self.on_delete = on_delete;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }
}

/// Schema-qualify an index name the same way as its table
fn qualified_index_name(table: &str, index: &str) -> String {
    match table.split_once('.') {
        Some((schema, _)) if !index.contains('.') => format!("{}.{}", schema, index),
        _ => index.to_string(),
    }
}

impl MigrationContext {
    /// Create an index without blocking writes (`CREATE INDEX CONCURRENTLY`)
    pub async fn add_concurrent_index(
        &mut self,
        table: &str,
        columns: &[&str],
        options: &IndexOptions,
    ) -> MigrationResult<()> {
        self.ensure_no_transaction("add_concurrent_index")?;

        if self.index_exists(table, columns, options).await? {
            tracing::warn!(
                table,
                columns = %columns.join(", "),
                "index not created because it already exists"
            );
            return Ok(());
        }

        let sql = create_index_sql(
            self.dialect(),
            table,
            columns,
            options,
            self.dialect().supports_concurrent_index(),
        );
        self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) }))
            .await
    }

    /// Drop the index covering `columns` (and matching `options`) concurrently
    pub async fn remove_concurrent_index(
        &mut self,
        table: &str,
        columns: &[&str],
        options: &IndexOptions,
    ) -> MigrationResult<()> {
        self.ensure_no_transaction("remove_concurrent_index")?;

        let existing = self.indexes(table).await?.into_iter().find(|index| {
            index.columns.iter().map(String::as_str).eq(columns.iter().copied())
                && options.name.as_deref().map_or(true, |n| index.name == n)
                && (!options.unique || index.unique)
        });

        match existing {
            Some(index) => self.drop_index_concurrently(table, &index.name).await,
            None => {
                tracing::warn!(
                    table,
                    columns = %columns.join(", "),
                    "index not removed because it does not exist"
                );
                Ok(())
            }
        }
    }

    pub async fn remove_concurrent_index_by_name(&mut self, table: &str, index: &str) -> MigrationResult<()> {
        self.ensure_no_transaction("remove_concurrent_index_by_name")?;

        if !self.index_exists_by_name(table, index).await? {
            tracing::warn!(table, index, "index not removed because it does not exist");
            return Ok(());
        }

        self.drop_index_concurrently(table, index).await
    }

    async fn drop_index_concurrently(&mut self, table: &str, index: &str) -> MigrationResult<()> {
        let sql = drop_index_sql(
            self.dialect(),
            &qualified_index_name(table, index),
            self.dialect().supports_concurrent_index(),
        );
        self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) }))
            .await
    }

    /// Add a foreign key from `source.column` to `target.id` with minimal locking.
    ///
    /// The key is added `NOT VALID` under `with_lock_retries`, so only new
    /// rows are checked; existing rows are validated afterwards when
    /// `options.validate` is set.
    pub async fn add_concurrent_foreign_key(
        &mut self,
        source: &str,
        target: &str,
        options: &ForeignKeyOptions,
    ) -> MigrationResult<()> {
        self.ensure_no_transaction("add_concurrent_foreign_key")?;
        if !self.dialect().supports_not_valid() {
            return Err(MigrationError::unsupported("add_concurrent_foreign_key", self.dialect()));
        }

        let name = options
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| concurrent_foreign_key_name(source, &options.column, FOREIGN_KEY_PREFIX));

        let mut filter = ForeignKeyFilter::default().column(options.column.as_str()).name(name.as_str());
        filter.on_delete = options.on_delete;

        if self.foreign_key_exists(source, Some(target), &filter).await? {
            tracing::warn!(
                source,
                target,
                column = %options.column,
                name = %name,
                "foreign key not created because it exists already"
            );
        } else {
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} (id){} NOT VALID",
                self.quote(source),
                self.quote(&name),
                self.quote(&options.column),
                self.quote(target),
                options
                    .on_delete
                    .map(|d| format!(" {}", d.to_sql()))
                    .unwrap_or_default()
            );
            self.with_lock_retries(|ctx| {
                let sql = sql.clone();
                Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) })
            })
            .await?;
        }

        if options.validate {
            let sql = format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                self.quote(source),
                self.quote(&name)
            );
            self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) }))
                .await?;
        }
        Ok(())
    }

    /// Validate a `NOT VALID` foreign key; `name` defaults to the concurrent key name
    pub async fn validate_foreign_key(
        &mut self,
        source: &str,
        column: &str,
        name: Option<&str>,
    ) -> MigrationResult<()> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| concurrent_foreign_key_name(source, column, FOREIGN_KEY_PREFIX));

        let filter = ForeignKeyFilter::default().name(name.as_str());
        if !self.foreign_key_exists(source, None, &filter).await? {
            return Err(MigrationError::missing_schema_object(source, "foreign key", name));
        }

        let sql = format!(
            "ALTER TABLE {} VALIDATE CONSTRAINT {}",
            self.quote(source),
            self.quote(&name)
        );
        self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) }))
            .await
    }

    /// Drop the first foreign key on `source` matching `target` and `filter`, if any.
    ///
    /// Returns whether a key was dropped.
    pub async fn remove_foreign_key_if_exists(
        &mut self,
        source: &str,
        target: Option<&str>,
        filter: &ForeignKeyFilter,
    ) -> MigrationResult<bool> {
        let target_name = target.map(|t| t.rsplit('.').next().unwrap_or(t));
        let existing = self
            .foreign_keys(source)
            .await?
            .into_iter()
            .find(|fk| target_name.map_or(true, |t| fk.to_table == t) && filter.matches(fk));

        let Some(foreign_key) = existing else {
            tracing::warn!(source, "foreign key not removed because it does not exist");
            return Ok(false);
        };

        let name = match foreign_key.name {
            Some(name) if self.dialect().supports_alter_constraints() => name,
            _ => {
                return Err(MigrationError::unsupported(
                    "remove_foreign_key_if_exists",
                    self.dialect(),
                ))
            }
        };

        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote(source),
            self.quote(&name)
        );
        self.execute(&sql).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DatabaseRow, DatabaseValue};
    use crate::context::test_support::{sqlite_context, RecordingConnection};

    async fn ci_variables_context() -> MigrationContext {
        let mut ctx = sqlite_context().await;
        ctx.execute("CREATE TABLE projects (id INTEGER PRIMARY KEY)").await.unwrap();
        ctx.execute(
            "CREATE TABLE ci_variables (id INTEGER PRIMARY KEY, \
             project_id INTEGER REFERENCES projects (id) ON DELETE CASCADE, \
             key TEXT NOT NULL, environment_scope TEXT NOT NULL DEFAULT '*')",
        )
        .await
        .unwrap();
        ctx
    }

    #[test]
    fn test_foreign_key_options_defaults() {
        let options = ForeignKeyOptions::new("project_id");
        assert_eq!(options.on_delete, Some(OnDelete::Cascade));
        assert!(options.validate);
        assert!(options.name.is_none());
        assert!(!options.without_validation().validate);
    }

    #[test]
    fn test_qualified_index_name() {
        assert_eq!(qualified_index_name("public.users", "index_users_on_id"), "public.index_users_on_id");
        assert_eq!(qualified_index_name("users", "index_users_on_id"), "index_users_on_id");
    }

    #[tokio::test]
    async fn test_add_concurrent_index_is_idempotent() {
        let mut ctx = ci_variables_context().await;
        let columns = ["project_id", "key", "environment_scope"];
        let options = IndexOptions::new()
            .unique()
            .name("index_ci_variables_on_project_id_and_key_and_environment_scope");

        ctx.add_concurrent_index("ci_variables", &columns, &options)
            .await
            .unwrap();
        ctx.add_concurrent_index("ci_variables", &columns, &options)
            .await
            .unwrap();

        let indexes = ctx.indexes("ci_variables").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].unique);

        ctx.remove_concurrent_index("ci_variables", &columns, &IndexOptions::new())
            .await
            .unwrap();
        assert!(ctx.indexes("ci_variables").await.unwrap().is_empty());

        // Removing again only warns
        ctx.remove_concurrent_index("ci_variables", &columns, &IndexOptions::new())
            .await
            .unwrap();
        ctx.remove_concurrent_index_by_name("ci_variables", "index_missing")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_helpers_refuse_open_transaction() {
        let mut ctx = ci_variables_context().await;
        ctx.begin().await.unwrap();

        let err = ctx
            .add_concurrent_index("ci_variables", &["key"], &IndexOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TransactionOpen { .. }));

        let err = ctx
            .add_concurrent_foreign_key("ci_variables", "projects", &ForeignKeyOptions::new("project_id"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TransactionOpen { .. }));

        ctx.rollback().await.unwrap();
        assert!(!ctx.index_exists("ci_variables", &["key"], &IndexOptions::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_key_helpers_on_sqlite() {
        let mut ctx = ci_variables_context().await;

        let err = ctx
            .add_concurrent_foreign_key("ci_variables", "projects", &ForeignKeyOptions::new("project_id"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Unsupported { .. }));

        let err = ctx
            .validate_foreign_key("ci_variables", "project_id", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MissingSchemaObject { .. }));

        let filter = ForeignKeyFilter::default().column("key");
        assert!(!ctx
            .remove_foreign_key_if_exists("ci_variables", Some("projects"), &filter)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_postgres_index_created_concurrently() {
        let conn = RecordingConnection::new();
        let executed = conn.executed();
        let mut ctx = conn.into_context();

        ctx.add_concurrent_index("t", &["a"], &IndexOptions::new()).await.unwrap();

        assert_eq!(
            executed.statements(),
            vec![
                "SET statement_timeout TO 0",
                "CREATE INDEX CONCURRENTLY \"index_t_on_a\" ON \"t\" (\"a\")",
                "RESET ALL",
            ]
        );
    }

    #[tokio::test]
    async fn test_postgres_index_dropped_concurrently() {
        let conn = RecordingConnection::new().answer_rows(
            "FROM pg_index",
            vec![DatabaseRow::new(
                vec!["index_name".to_string(), "is_unique".to_string(), "column_name".to_string()],
                vec!["index_t_on_a".into(), DatabaseValue::Bool(false), "a".into()],
            )],
        );
        let executed = conn.executed();
        let mut ctx = conn.into_context();

        ctx.add_concurrent_index("t", &["a"], &IndexOptions::new()).await.unwrap();
        assert!(executed.statements().is_empty());

        ctx.remove_concurrent_index_by_name("t", "index_t_on_a").await.unwrap();
        assert_eq!(
            executed.statements(),
            vec![
                "SET statement_timeout TO 0",
                "DROP INDEX CONCURRENTLY \"index_t_on_a\"",
                "RESET ALL",
            ]
        );
    }

    #[tokio::test]
    async fn test_postgres_foreign_key_added_not_valid_then_validated() {
        let conn = RecordingConnection::new();
        let executed = conn.executed();
        let mut ctx = conn.into_context();
        let name = concurrent_foreign_key_name("ci_variables", "project_id", FOREIGN_KEY_PREFIX);

        ctx.add_concurrent_foreign_key("ci_variables", "projects", &ForeignKeyOptions::new("project_id"))
            .await
            .unwrap();

        assert_eq!(
            executed.statements(),
            vec![
                "BEGIN".to_string(),
                "SET LOCAL lock_timeout TO '100ms'".to_string(),
                format!(
                    "ALTER TABLE \"ci_variables\" ADD CONSTRAINT \"{name}\" FOREIGN KEY (\"project_id\") \
                     REFERENCES \"projects\" (id) ON DELETE CASCADE NOT VALID"
                ),
                "COMMIT".to_string(),
                "SET statement_timeout TO 0".to_string(),
                format!("ALTER TABLE \"ci_variables\" VALIDATE CONSTRAINT \"{name}\""),
                "RESET ALL".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_postgres_foreign_key_without_validation() {
        let conn = RecordingConnection::new();
        let executed = conn.executed();
        let mut ctx = conn.into_context();

        let options = ForeignKeyOptions::new("project_id").on_delete(None).without_validation();
        ctx.add_concurrent_foreign_key("ci_variables", "projects", &options)
            .await
            .unwrap();

        let statements = executed.statements();
        assert!(statements[2].ends_with("REFERENCES \"projects\" (id) NOT VALID"));
        assert!(!statements.iter().any(|s| s.contains("VALIDATE")));
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    }
}
