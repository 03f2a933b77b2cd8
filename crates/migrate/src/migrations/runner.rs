//! Migration Runner - Executes migrations against the database
//!
//! Handles the actual execution of migrations, tracking applied migrations
//! in the ledger and grouping each run into a batch.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tidemark_core::TidemarkConfig;

use super::definitions::{
    Migration, MigrationDirection, MigrationRunResult, MigrationStatus, MigrationStatusEntry,
};
use super::ledger::Ledger;
use crate::backends::DatabaseValue;
use crate::context::MigrationContext;
use crate::error::{MigrationError, MigrationResult};

/// Session advisory lock key held while migrating
const ADVISORY_LOCK_KEY: i64 = 0x7469_6465_6d61_726b;

/// Runner settings taken from the `migrations` section of the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MigratorSettings {
    pub table: String,
    pub advisory_lock: bool,
    /// Empty allows every restriction scope
    pub allowed_schemas: Vec<String>,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            table: super::ledger::DEFAULT_LEDGER_TABLE.to_string(),
            advisory_lock: true,
            allowed_schemas: Vec::new(),
        }
    }
}

impl MigratorSettings {
    pub fn from_config(config: &TidemarkConfig) -> Self {
        Self {
            table: config.migrations.table.clone(),
            advisory_lock: config.migrations.advisory_lock,
            allowed_schemas: config.migrations.allowed_schemas.clone(),
        }
    }

    /// Whether a migration restricted to `scope` runs on this database
    pub fn allows(&self, scope: &str) -> bool {
        self.allowed_schemas.is_empty() || self.allowed_schemas.iter().any(|s| s == scope)
    }
}

/// Migration runner that executes migrations against a database
pub struct Migrator {
    ctx: MigrationContext,
    ledger: Ledger,
    settings: MigratorSettings,
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Create a runner; migrations are sorted by version and must not share one
    pub fn new(
        ctx: MigrationContext,
        settings: MigratorSettings,
        mut migrations: Vec<Box<dyn Migration>>,
    ) -> MigrationResult<Self> {
        migrations.sort_by_key(|m| m.version());

        for pair in migrations.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(MigrationError::DuplicateVersion {
                    version: pair[0].version(),
                    first: pair[0].name().to_string(),
                    second: pair[1].name().to_string(),
                });
            }
        }

        Ok(Self {
            ctx,
            ledger: Ledger::new(settings.table.clone()),
            settings,
            migrations,
        })
    }

    /// Connect using the configuration and build a runner
    pub async fn from_config(
        config: &TidemarkConfig,
        migrations: Vec<Box<dyn Migration>>,
    ) -> MigrationResult<Self> {
        let ctx = MigrationContext::connect(config).await?;
        Self::new(ctx, MigratorSettings::from_config(config), migrations)
    }

    pub fn context(&mut self) -> &mut MigrationContext {
        &mut self.ctx
    }

    pub fn into_context(self) -> MigrationContext {
        self.ctx
    }

    pub async fn close(self) -> MigrationResult<()> {
        self.ctx.close().await
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn settings(&self) -> &MigratorSettings {
        &self.settings
    }

    /// Known migrations in ascending version order
    pub fn migrations(&self) -> &[Box<dyn Migration>] {
        &self.migrations
    }

    pub fn migration(&self, version: i64) -> Option<&dyn Migration> {
        self.index_of(version).map(|i| self.migrations[i].as_ref())
    }

    fn index_of(&self, version: i64) -> Option<usize> {
        self.migrations.binary_search_by_key(&version, |m| m.version()).ok()
    }

    /// Apply every pending migration up to and including `target`
    pub async fn migrate(&mut self, target: Option<i64>) -> MigrationResult<MigrationRunResult> {
        self.ledger.ensure(&mut self.ctx).await?;
        self.acquire_lock().await?;
        let result = self.migrate_locked(target).await;
        self.release_lock().await;
        result
    }

    async fn migrate_locked(&mut self, target: Option<i64>) -> MigrationResult<MigrationRunResult> {
        let start_time = Instant::now();
        let pending = self.pending_versions(target).await?;

        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(MigrationRunResult {
                skipped_count: self.migrations.len(),
                execution_time_ms: start_time.elapsed().as_millis(),
                ..Default::default()
            });
        }

        let batch = self.ledger.latest_batch(&mut self.ctx).await? + 1;
        let applied_migrations = self.apply_versions(&pending, batch).await?;

        Ok(MigrationRunResult {
            applied_count: applied_migrations.len(),
            skipped_count: self.migrations.len() - applied_migrations.len(),
            applied_migrations,
            batch: Some(batch),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    /// Apply `versions` in order under `batch`, stopping at the first failure
    pub(super) async fn apply_versions(&mut self, versions: &[i64], batch: i32) -> MigrationResult<Vec<i64>> {
        let mut applied = Vec::with_capacity(versions.len());
        for &version in versions {
            let index = self
                .index_of(version)
                .ok_or(MigrationError::UnknownVersion(version))?;
            self.execute(index, MigrationDirection::Up, batch).await?;
            applied.push(version);
        }
        Ok(applied)
    }

    /// Apply one migration regardless of the others
    pub async fn run_up(&mut self, version: i64) -> MigrationResult<()> {
        let index = self
            .index_of(version)
            .ok_or(MigrationError::UnknownVersion(version))?;
        self.ledger.ensure(&mut self.ctx).await?;
        if self.ledger.is_applied(&mut self.ctx, version).await? {
            return Err(MigrationError::AlreadyApplied(version));
        }

        self.acquire_lock().await?;
        let result = async {
            let batch = self.ledger.latest_batch(&mut self.ctx).await? + 1;
            self.execute(index, MigrationDirection::Up, batch).await
        }
        .await;
        self.release_lock().await;
        result
    }

    /// Revert one applied migration regardless of the others
    pub async fn run_down(&mut self, version: i64) -> MigrationResult<()> {
        let index = self
            .index_of(version)
            .ok_or(MigrationError::UnknownVersion(version))?;
        self.ledger.ensure(&mut self.ctx).await?;
        if !self.ledger.is_applied(&mut self.ctx, version).await? {
            return Err(MigrationError::NotApplied(version));
        }

        self.acquire_lock().await?;
        let result = self.execute(index, MigrationDirection::Down, 0).await;
        self.release_lock().await;
        result
    }

    /// Every known version plus versions only the ledger knows, ascending
    pub async fn status(&mut self) -> MigrationResult<Vec<MigrationStatusEntry>> {
        self.ledger.ensure(&mut self.ctx).await?;
        let mut applied: HashMap<i64, MigrationStatus> = self
            .ledger
            .applied(&mut self.ctx)
            .await?
            .into_iter()
            .map(|r| {
                (
                    r.version,
                    MigrationStatus::Applied {
                        applied_at: r.applied_at,
                        batch: r.batch,
                    },
                )
            })
            .collect();

        let mut entries: Vec<MigrationStatusEntry> = self
            .migrations
            .iter()
            .map(|m| MigrationStatusEntry {
                version: m.version(),
                name: Some(m.name().to_string()),
                status: applied.remove(&m.version()).unwrap_or(MigrationStatus::Pending),
            })
            .collect();

        entries.extend(applied.into_iter().map(|(version, status)| MigrationStatusEntry {
            version,
            name: None,
            status,
        }));
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    /// Migrations `migrate(target)` would apply, in order
    pub async fn pending(&mut self, target: Option<i64>) -> MigrationResult<Vec<MigrationStatusEntry>> {
        self.ledger.ensure(&mut self.ctx).await?;
        let versions = self.pending_versions(target).await?;
        Ok(versions
            .into_iter()
            .filter_map(|v| self.migration(v))
            .map(|m| MigrationStatusEntry {
                version: m.version(),
                name: Some(m.name().to_string()),
                status: MigrationStatus::Pending,
            })
            .collect())
    }

    async fn pending_versions(&mut self, target: Option<i64>) -> MigrationResult<Vec<i64>> {
        let applied: HashSet<i64> = self
            .ledger
            .applied(&mut self.ctx)
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect();

        Ok(self
            .migrations
            .iter()
            .map(|m| m.version())
            .filter(|v| !applied.contains(v) && target.map_or(true, |t| *v <= t))
            .collect())
    }

    /// Run one migration in `direction` and update the ledger.
    ///
    /// Transactional migrations run their body and the ledger write in one
    /// transaction. Migrations restricted to a scope this database does not
    /// serve only have their ledger row written.
    pub(super) async fn execute(
        &mut self,
        index: usize,
        direction: MigrationDirection,
        batch: i32,
    ) -> MigrationResult<()> {
        let migration = self.migrations[index].as_ref();
        let version = migration.version();
        let name = migration.name().to_string();
        let start_time = Instant::now();

        let skip_body = migration
            .restriction()
            .is_some_and(|scope| !self.settings.allows(scope));

        if skip_body {
            tracing::info!(
                version,
                name = %name,
                restriction = migration.restriction().unwrap_or_default(),
                %direction,
                "restricted migration skipped on this database, updating ledger only"
            );
        } else {
            tracing::info!(version, name = %name, %direction, "running migration");
        }

        let ctx = &mut self.ctx;
        let ledger = &self.ledger;
        let transactional = migration.ddl_transaction() && !skip_body;

        let result = async {
            if transactional {
                ctx.begin().await?;
            }

            if !skip_body {
                match direction {
                    MigrationDirection::Up => migration.up(ctx).await?,
                    MigrationDirection::Down => migration.down(ctx).await?,
                }
            }

            match direction {
                MigrationDirection::Up => ledger.record(ctx, version, batch).await?,
                MigrationDirection::Down => ledger.remove(ctx, version).await?,
            }

            if transactional {
                ctx.commit().await?;
            }
            Ok::<(), MigrationError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    version,
                    name = %name,
                    %direction,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "migration finished"
                );
                Ok(())
            }
            Err(err) => {
                let err = ctx.rollback_after_error(err).await;
                tracing::error!(version, name = %name, %direction, error = %err, "migration failed");
                Err(MigrationError::MigrationFailed {
                    version,
                    name,
                    source: Box::new(err),
                })
            }
        }
    }

    fn uses_advisory_lock(&self) -> bool {
        self.settings.advisory_lock && self.ctx.dialect().supports_advisory_locks()
    }

    /// Take the session advisory lock, failing when another process holds it
    pub(super) async fn acquire_lock(&mut self) -> MigrationResult<()> {
        if !self.uses_advisory_lock() {
            return Ok(());
        }

        let acquired = self
            .ctx
            .select_value("SELECT pg_try_advisory_lock($1)", &[DatabaseValue::Int(ADVISORY_LOCK_KEY)])
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !acquired {
            return Err(MigrationError::ConcurrentMigration);
        }
        tracing::debug!(key = ADVISORY_LOCK_KEY, "advisory lock acquired");
        Ok(())
    }

    pub(super) async fn release_lock(&mut self) {
        if !self.uses_advisory_lock() {
            return;
        }

        if let Err(err) = self
            .ctx
            .select_value("SELECT pg_advisory_unlock($1)", &[DatabaseValue::Int(ADVISORY_LOCK_KEY)])
            .await
        {
            tracing::error!(error = %err, "failed to release advisory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{sqlite_context, RecordingConnection};
    use async_trait::async_trait;

    struct CreateTable {
        version: i64,
        table: &'static str,
        restriction: Option<&'static str>,
    }

    #[async_trait]
    impl Migration for CreateTable {
        fn version(&self) -> i64 {
            self.version
        }

        fn name(&self) -> &str {
            self.table
        }

        fn restriction(&self) -> Option<&str> {
            self.restriction
        }

        async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
            ctx.execute(&format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", self.table))
                .await?;
            Ok(())
        }

        async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
            ctx.drop_table(self.table).await
        }
    }

    struct Failing;

    #[async_trait]
    impl Migration for Failing {
        fn version(&self) -> i64 {
            3
        }

        fn name(&self) -> &str {
            "failing"
        }

        async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
            ctx.execute("CREATE TABLE half_done (id INTEGER)").await?;
            ctx.execute("INSERT INTO missing_table VALUES (1)").await?;
            Ok(())
        }
    }

    fn table(version: i64, table: &'static str) -> Box<dyn Migration> {
        Box::new(CreateTable {
            version,
            table,
            restriction: None,
        })
    }

    async fn migrator(migrations: Vec<Box<dyn Migration>>) -> Migrator {
        Migrator::new(sqlite_context().await, MigratorSettings::default(), migrations).unwrap()
    }

    #[tokio::test]
    async fn test_migrate_applies_in_order_once() {
        let mut migrator = migrator(vec![table(2, "second"), table(1, "first")]).await;

        let result = migrator.migrate(None).await.unwrap();
        assert_eq!(result.applied_migrations, vec![1, 2]);
        assert_eq!(result.batch, Some(1));

        let again = migrator.migrate(None).await.unwrap();
        assert_eq!(again.applied_count, 0);
        assert_eq!(again.skipped_count, 2);

        let status = migrator.status().await.unwrap();
        assert!(status.iter().all(|e| e.status.is_applied()));
    }

    #[tokio::test]
    async fn test_migrate_respects_target() {
        let mut migrator = migrator(vec![table(1, "first"), table(2, "second"), table(3, "third")]).await;

        let result = migrator.migrate(Some(2)).await.unwrap();
        assert_eq!(result.applied_migrations, vec![1, 2]);

        let pending: Vec<i64> = migrator.pending(None).await.unwrap().iter().map(|e| e.version).collect();
        assert_eq!(pending, vec![3]);

        let result = migrator.migrate(None).await.unwrap();
        assert_eq!(result.applied_migrations, vec![3]);
        assert_eq!(result.batch, Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_versions_rejected() {
        let result = Migrator::new(
            sqlite_context().await,
            MigratorSettings::default(),
            vec![table(1, "first"), table(1, "again")],
        );
        assert!(matches!(result, Err(MigrationError::DuplicateVersion { version: 1, .. })));
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back_and_is_not_recorded() {
        let mut migrator = migrator(vec![table(1, "first"), Box::new(Failing), table(4, "fourth")]).await;

        let err = migrator.migrate(None).await.unwrap_err();
        match &err {
            MigrationError::MigrationFailed { version, name, .. } => {
                assert_eq!(*version, 3);
                assert_eq!(name, "failing");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(migrator.context().table_exists("first").await.unwrap());
        assert!(!migrator.context().table_exists("half_done").await.unwrap());
        assert!(!migrator.context().table_exists("fourth").await.unwrap());
        assert!(!migrator.context().transaction_open());

        let status = migrator.status().await.unwrap();
        let applied: Vec<i64> = status
            .iter()
            .filter(|e| e.status.is_applied())
            .map(|e| e.version)
            .collect();
        assert_eq!(applied, vec![1]);
    }

    #[tokio::test]
    async fn test_restricted_migration_recorded_without_running() {
        let ctx = sqlite_context().await;
        let settings = MigratorSettings {
            allowed_schemas: vec!["main".to_string()],
            ..Default::default()
        };
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(CreateTable {
                version: 1,
                table: "main_only",
                restriction: Some("main"),
            }),
            Box::new(CreateTable {
                version: 2,
                table: "ci_only",
                restriction: Some("ci"),
            }),
        ];
        let mut migrator = Migrator::new(ctx, settings, migrations).unwrap();

        let result = migrator.migrate(None).await.unwrap();
        assert_eq!(result.applied_migrations, vec![1, 2]);
        assert!(migrator.context().table_exists("main_only").await.unwrap());
        assert!(!migrator.context().table_exists("ci_only").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_up_and_down() {
        let mut migrator = migrator(vec![table(1, "first"), table(2, "second")]).await;

        migrator.run_up(2).await.unwrap();
        assert!(matches!(migrator.run_up(2).await, Err(MigrationError::AlreadyApplied(2))));
        assert!(matches!(migrator.run_up(9).await, Err(MigrationError::UnknownVersion(9))));
        assert!(matches!(migrator.run_down(1).await, Err(MigrationError::NotApplied(1))));

        migrator.run_down(2).await.unwrap();
        assert!(!migrator.context().table_exists("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_ledger_only_versions() {
        let mut migrator = migrator(vec![table(1, "first")]).await;
        migrator.migrate(None).await.unwrap();

        let ledger = migrator.ledger().clone();
        ledger.record(migrator.context(), 99, 1).await.unwrap();

        let status = migrator.status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].version, 99);
        assert_eq!(status[1].name, None);
        assert!(status[1].status.is_applied());
    }

    const TRY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";
    const UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

    fn postgres(lock_available: bool) -> RecordingConnection {
        RecordingConnection::new().answer("pg_try_advisory_lock", DatabaseValue::Bool(lock_available))
    }

    #[tokio::test]
    async fn test_postgres_migrate_holds_advisory_lock() {
        let conn = postgres(true);
        let (executed, queried) = (conn.executed(), conn.queried());
        let mut migrator =
            Migrator::new(conn.into_context(), MigratorSettings::default(), vec![table(1, "first")]).unwrap();

        let result = migrator.migrate(None).await.unwrap();
        assert_eq!(result.applied_migrations, vec![1]);

        let statements = executed.statements();
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"schema_migrations\""));
        assert_eq!(
            statements[1..],
            [
                "BEGIN",
                "CREATE TABLE first (id INTEGER PRIMARY KEY)",
                "INSERT INTO \"schema_migrations\" (version, batch) VALUES ($1, $2)",
                "COMMIT",
            ]
        );

        let queries = queried.statements();
        assert_eq!(queries.first().map(String::as_str), Some(TRY_LOCK));
        assert_eq!(queries.last().map(String::as_str), Some(UNLOCK));
    }

    #[tokio::test]
    async fn test_postgres_held_lock_is_concurrent_migration() {
        let conn = postgres(false);
        let (executed, queried) = (conn.executed(), conn.queried());
        let mut migrator =
            Migrator::new(conn.into_context(), MigratorSettings::default(), vec![table(1, "first")]).unwrap();

        let err = migrator.migrate(None).await.unwrap_err();
        assert!(matches!(err, MigrationError::ConcurrentMigration));

        // only the ledger table was ensured; nothing ran and nothing to unlock
        assert_eq!(executed.statements().len(), 1);
        assert_eq!(queried.statements(), vec![TRY_LOCK]);
    }

    #[tokio::test]
    async fn test_postgres_lock_released_after_failure() {
        let conn = postgres(true).lock_timeout_on("missing_table", 1);
        let (executed, queried) = (conn.executed(), conn.queried());
        let mut migrator =
            Migrator::new(conn.into_context(), MigratorSettings::default(), vec![Box::new(Failing)]).unwrap();

        let err = migrator.migrate(None).await.unwrap_err();
        assert!(err.root_cause().is_lock_timeout());

        let statements = executed.statements();
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!statements.iter().any(|s| s.starts_with("INSERT INTO \"schema_migrations\"")));
        assert_eq!(queried.statements().last().map(String::as_str), Some(UNLOCK));
    }

    #[tokio::test]
    async fn test_postgres_advisory_lock_can_be_disabled() {
        let conn = postgres(false);
        let queried = conn.queried();
        let settings = MigratorSettings {
            advisory_lock: false,
            ..MigratorSettings::default()
        };
        let mut migrator = Migrator::new(conn.into_context(), settings, vec![table(1, "first")]).unwrap();

        migrator.migrate(None).await.unwrap();
        assert!(!queried.statements().iter().any(|q| q.contains("advisory")));
    }
}
