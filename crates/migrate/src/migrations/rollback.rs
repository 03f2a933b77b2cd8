//! Migration Rollback - Handles rolling back applied migrations
//!
//! Rolls back by step count or by batch, executing `down` newest first.

use std::time::Instant;

use serde::Serialize;

use super::definitions::{MigrationDirection, MigrationRecord, MigrationRunResult, RollbackResult};
use super::runner::Migrator;
use crate::error::{MigrationError, MigrationResult};

/// Result of `redo`
#[derive(Debug, Default, Serialize)]
pub struct RedoResult {
    pub rollback: RollbackResult,
    pub migrate: MigrationRunResult,
}

impl Migrator {
    /// Roll back the `steps` most recently applied versions, newest first
    pub async fn rollback(&mut self, steps: usize) -> MigrationResult<RollbackResult> {
        self.ledger().clone().ensure(self.context()).await?;
        let mut applied = self.applied_records().await?;
        applied.reverse();
        applied.truncate(steps);
        self.rollback_records(applied).await
    }

    /// Roll back every version of the highest batch
    pub async fn rollback_last_batch(&mut self) -> MigrationResult<RollbackResult> {
        let ledger = self.ledger().clone();
        ledger.ensure(self.context()).await?;
        let latest = ledger.latest_batch(self.context()).await?;
        if latest == 0 {
            return Ok(RollbackResult::default());
        }

        let mut records: Vec<MigrationRecord> = self
            .applied_records()
            .await?
            .into_iter()
            .filter(|r| r.batch == latest)
            .collect();
        records.reverse();
        self.rollback_records(records).await
    }

    /// Roll back `steps` versions, then apply them again
    pub async fn redo(&mut self, steps: usize) -> MigrationResult<RedoResult> {
        let rollback = self.rollback(steps).await?;
        if rollback.rolled_back_count == 0 {
            return Ok(RedoResult {
                rollback,
                migrate: MigrationRunResult::default(),
            });
        }

        let start_time = Instant::now();
        let mut versions = rollback.rolled_back_migrations.clone();
        versions.sort_unstable();

        self.acquire_lock().await?;
        let applied = async {
            let batch = self.ledger().clone().latest_batch(self.context()).await? + 1;
            let applied = self.apply_versions(&versions, batch).await?;
            Ok::<_, MigrationError>((batch, applied))
        }
        .await;
        self.release_lock().await;
        let (batch, applied_migrations) = applied?;

        Ok(RedoResult {
            rollback,
            migrate: MigrationRunResult {
                applied_count: applied_migrations.len(),
                skipped_count: self.migrations().len() - applied_migrations.len(),
                applied_migrations,
                batch: Some(batch),
                execution_time_ms: start_time.elapsed().as_millis(),
            },
        })
    }

    async fn applied_records(&mut self) -> MigrationResult<Vec<MigrationRecord>> {
        let ledger = self.ledger().clone();
        ledger.applied(self.context()).await
    }

    /// Run `down` for each record in the given order
    async fn rollback_records(&mut self, records: Vec<MigrationRecord>) -> MigrationResult<RollbackResult> {
        let start_time = Instant::now();
        if records.is_empty() {
            tracing::info!("nothing to roll back");
            return Ok(RollbackResult::default());
        }

        // Every version needs a definition before anything is reverted
        let mut indexes = Vec::with_capacity(records.len());
        for record in &records {
            let index = self
                .migrations()
                .iter()
                .position(|m| m.version() == record.version)
                .ok_or(MigrationError::MissingMigration(record.version))?;
            indexes.push((record.version, index));
        }

        self.acquire_lock().await?;
        let mut rolled_back_migrations = Vec::with_capacity(indexes.len());
        let mut result = Ok(());
        for (version, index) in indexes {
            if let Err(err) = self.execute(index, MigrationDirection::Down, 0).await {
                result = Err(err);
                break;
            }
            rolled_back_migrations.push(version);
        }
        self.release_lock().await;
        result?;

        Ok(RollbackResult {
            rolled_back_count: rolled_back_migrations.len(),
            rolled_back_migrations,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}
