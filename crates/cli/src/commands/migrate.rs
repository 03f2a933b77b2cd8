use anyhow::Context;
use console::style;
use tidemark_core::TidemarkConfig;
use tidemark_migrate::{
    Migration, MigrationManager, MigrationRunResult, MigrationStatus, MigrationStatusEntry, Migrator,
    RollbackResult,
};

/// Catalog migrations followed by the SQL files of the configured directory
fn load_migrations(config: &TidemarkConfig) -> anyhow::Result<Vec<Box<dyn Migration>>> {
    let manager = MigrationManager::new(&config.migrations.dir);
    let mut migrations = tidemark_schema::migrations();

    let files = manager
        .load_migrations()
        .with_context(|| format!("loading migrations from {}", config.migrations.dir.display()))?;
    tracing::debug!(
        dir = %config.migrations.dir.display(),
        files = files.len(),
        catalog = migrations.len(),
        "loaded migrations"
    );
    migrations.extend(files.into_iter().map(|m| Box::new(m) as Box<dyn Migration>));

    Ok(migrations)
}

async fn migrator(config: &TidemarkConfig) -> anyhow::Result<Migrator> {
    let migrations = load_migrations(config)?;
    Migrator::from_config(config, migrations)
        .await
        .context("connecting to the database")
}

pub fn create(config: &TidemarkConfig, name: &str) -> anyhow::Result<()> {
    let manager = MigrationManager::new(&config.migrations.dir);
    let path = manager.create_migration(name)?;
    tracing::info!(path = %path.display(), "created migration file");
    println!("{} {}", style("Created migration:").green(), path.display());
    Ok(())
}

pub async fn run(config: &TidemarkConfig, target: Option<i64>) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let result = migrator.migrate(target).await;
    migrator.close().await?;
    let result = result?;
    log_run_result(&result);
    print_run_result(&result);
    Ok(())
}

pub async fn rollback(config: &TidemarkConfig, steps: usize, batch: bool) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let result = if batch {
        migrator.rollback_last_batch().await
    } else {
        migrator.rollback(steps).await
    };
    migrator.close().await?;
    let result = result?;
    log_rollback_result(&result);
    print_rollback_result(&result);
    Ok(())
}

pub async fn status(config: &TidemarkConfig, json: bool) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let entries = migrator.status().await;
    migrator.close().await?;
    let entries = entries?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{}", style("Migration Status").bold());
    println!("================");
    if entries.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    for entry in &entries {
        print_status_line(entry);
    }

    let applied = entries.iter().filter(|e| e.status.is_applied()).count();
    println!();
    println!("{} applied, {} pending", applied, entries.len() - applied);
    Ok(())
}

pub async fn up(config: &TidemarkConfig, version: i64) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let result = migrator.run_up(version).await;
    migrator.close().await?;
    result?;
    tracing::info!(version, "migration applied");
    println!("{} {}", style("Applied").green(), version);
    Ok(())
}

pub async fn down(config: &TidemarkConfig, version: i64) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let result = migrator.run_down(version).await;
    migrator.close().await?;
    result?;
    tracing::info!(version, "migration rolled back");
    println!("{} {}", style("Rolled back").yellow(), version);
    Ok(())
}

pub async fn redo(config: &TidemarkConfig, steps: usize) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let result = migrator.redo(steps).await;
    migrator.close().await?;
    let result = result?;
    log_rollback_result(&result.rollback);
    log_run_result(&result.migrate);
    print_rollback_result(&result.rollback);
    print_run_result(&result.migrate);
    Ok(())
}

pub async fn pending(config: &TidemarkConfig, target: Option<i64>) -> anyhow::Result<()> {
    let mut migrator = migrator(config).await?;
    let entries = migrator.pending(target).await;
    migrator.close().await?;
    let entries = entries?;

    if entries.is_empty() {
        println!("No pending migrations");
        return Ok(());
    }

    println!("{} pending migration(s):", entries.len());
    for entry in &entries {
        print_status_line(entry);
    }
    Ok(())
}

fn print_status_line(entry: &MigrationStatusEntry) {
    let name = entry.name.as_deref().unwrap_or("(no migration defines this version)");
    match &entry.status {
        MigrationStatus::Applied { applied_at, batch } => println!(
            "  {} {}  {}  {}",
            style("up  ").green(),
            entry.version,
            name,
            style(format!("batch {}, {}", batch, applied_at.format("%Y-%m-%d %H:%M:%S"))).dim()
        ),
        MigrationStatus::Pending => println!("  {} {}  {}", style("down").yellow(), entry.version, name),
    }
}

fn log_run_result(result: &MigrationRunResult) {
    tracing::info!(
        applied = result.applied_count,
        skipped = result.skipped_count,
        batch = ?result.batch,
        elapsed_ms = %result.execution_time_ms,
        "migrate finished"
    );
}

fn log_rollback_result(result: &RollbackResult) {
    tracing::info!(
        rolled_back = result.rolled_back_count,
        elapsed_ms = %result.execution_time_ms,
        "rollback finished"
    );
}

fn print_run_result(result: &MigrationRunResult) {
    if result.applied_count == 0 {
        println!("Nothing to migrate");
        return;
    }

    for version in &result.applied_migrations {
        println!("  {} {}", style("applied").green(), version);
    }
    println!(
        "Applied {} migration(s) in batch {} ({} ms)",
        result.applied_count,
        result.batch.unwrap_or_default(),
        result.execution_time_ms
    );
}

fn print_rollback_result(result: &RollbackResult) {
    if result.rolled_back_count == 0 {
        println!("Nothing to roll back");
        return;
    }

    for version in &result.rolled_back_migrations {
        println!("  {} {}", style("rolled back").yellow(), version);
    }
    println!(
        "Rolled back {} migration(s) ({} ms)",
        result.rolled_back_count, result.execution_time_ms
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> TidemarkConfig {
        let mut config = TidemarkConfig::default();
        config.migrations.dir = dir.path().join("migrate");
        config.database.url = Some("sqlite::memory:".to_string());
        config
    }

    #[test]
    fn test_catalog_and_files_are_combined() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        fs::create_dir_all(&config.migrations.dir).unwrap();
        fs::write(
            config.migrations.dir.join("20240101000000_create_audit_events.sql"),
            "-- Up migration\nCREATE TABLE audit_events (id INTEGER PRIMARY KEY);\n\
             -- Down migration\nDROP TABLE audit_events;\n",
        )
        .unwrap();

        let migrations = load_migrations(&config).unwrap();
        assert_eq!(migrations.len(), tidemark_schema::migrations().len() + 1);
        assert!(migrations.iter().any(|m| m.version() == 20240101000000));
    }

    #[test]
    fn test_create_writes_template() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        create(&config, "AddIndexToUsers").unwrap();

        let files: Vec<_> = fs::read_dir(&config.migrations.dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_run_against_sqlite() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);

        let mut migrator = migrator(&config).await.unwrap();
        let result = migrator.migrate(None).await.unwrap();
        assert_eq!(result.applied_count, tidemark_schema::migrations().len());
        migrator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_then_rollback_commands_share_database() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.database.url = Some(format!("sqlite://{}", dir.path().join("tidemark.db").display()));

        run(&config, None).await.unwrap();
        rollback(&config, 1, true).await.unwrap();

        let mut migrator = migrator(&config).await.unwrap();
        let pending = migrator.pending(None).await.unwrap();
        migrator.close().await.unwrap();
        assert_eq!(pending.len(), tidemark_schema::migrations().len());
    }
}
