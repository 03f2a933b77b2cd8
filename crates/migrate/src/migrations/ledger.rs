//! Migration Ledger - The table of applied versions
//!
//! One row per applied migration: `version` (stored as text), `applied_at`
//! and the `batch` it was applied in.

use chrono::{DateTime, NaiveDateTime, Utc};

use super::definitions::MigrationRecord;
use crate::context::MigrationContext;
use crate::error::{MigrationError, MigrationResult};

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// Reads and writes the ledger table through a migration context
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE)
    }
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist
    pub async fn ensure(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version VARCHAR(255) PRIMARY KEY,\n    \
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,\n    \
                batch INTEGER NOT NULL\n\
            )",
            ctx.quote(&self.table)
        );
        ctx.execute(&sql).await?;
        Ok(())
    }

    /// Applied migrations in ascending version order
    pub async fn applied(&self, ctx: &mut MigrationContext) -> MigrationResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, CAST(applied_at AS TEXT) AS applied_at, batch FROM {}",
            ctx.quote(&self.table)
        );
        let rows = ctx.select_all(&sql, &[]).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let version = row.get("version").and_then(|v| v.as_i64()).ok_or_else(|| {
                MigrationError::InvalidLedger(format!(
                    "version {:?} in {} is not an integer",
                    row.get("version"),
                    self.table
                ))
            })?;

            let applied_at = row
                .get_str("applied_at")
                .and_then(parse_timestamp)
                .ok_or_else(|| {
                    MigrationError::InvalidLedger(format!("applied_at of version {} is not a timestamp", version))
                })?;

            let batch = row
                .get_i64("batch")
                .and_then(|b| i32::try_from(b).ok())
                .ok_or_else(|| MigrationError::InvalidLedger(format!("batch of version {} is invalid", version)))?;

            records.push(MigrationRecord {
                version,
                applied_at,
                batch,
            });
        }

        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    pub async fn is_applied(&self, ctx: &mut MigrationContext, version: i64) -> MigrationResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE version = {}",
            ctx.quote(&self.table),
            ctx.dialect().placeholder(1)
        );
        Ok(ctx.select_count(&sql, &[version.to_string().into()]).await? > 0)
    }

    pub async fn record(&self, ctx: &mut MigrationContext, version: i64, batch: i32) -> MigrationResult<()> {
        let dialect = ctx.dialect();
        let sql = format!(
            "INSERT INTO {} (version, batch) VALUES ({}, {})",
            ctx.quote(&self.table),
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        ctx.execute_with(&sql, &[version.to_string().into(), batch.into()])
            .await?;
        Ok(())
    }

    pub async fn remove(&self, ctx: &mut MigrationContext, version: i64) -> MigrationResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            ctx.quote(&self.table),
            ctx.dialect().placeholder(1)
        );
        ctx.execute_with(&sql, &[version.to_string().into()]).await?;
        Ok(())
    }

    /// Highest batch number, 0 when nothing is applied
    pub async fn latest_batch(&self, ctx: &mut MigrationContext) -> MigrationResult<i32> {
        let sql = format!("SELECT COALESCE(MAX(batch), 0) FROM {}", ctx.quote(&self.table));
        let batch = ctx.select_count(&sql, &[]).await?;
        i32::try_from(batch).map_err(|_| MigrationError::InvalidLedger(format!("batch {} out of range", batch)))
    }
}

/// Parse the text form of `applied_at` on either backend
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::sqlite_context;

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2017-06-22 13:54:51").is_some());
        assert!(parse_timestamp("2017-06-22 13:54:51.123456").is_some());
        assert!(parse_timestamp("2017-06-22T13:54:51Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_record_and_remove() {
        let mut ctx = sqlite_context().await;
        let ledger = Ledger::default();
        ledger.ensure(&mut ctx).await.unwrap();
        ledger.ensure(&mut ctx).await.unwrap();

        assert_eq!(ledger.latest_batch(&mut ctx).await.unwrap(), 0);

        ledger.record(&mut ctx, 20170622135728, 2).await.unwrap();
        ledger.record(&mut ctx, 20160226100000, 1).await.unwrap();

        let applied = ledger.applied(&mut ctx).await.unwrap();
        let versions: Vec<i64> = applied.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![20160226100000, 20170622135728]);
        assert_eq!(applied[0].batch, 1);
        assert!(ledger.is_applied(&mut ctx, 20160226100000).await.unwrap());
        assert_eq!(ledger.latest_batch(&mut ctx).await.unwrap(), 2);

        // Primary key rejects a second row for the same version
        assert!(ledger.record(&mut ctx, 20160226100000, 3).await.is_err());

        ledger.remove(&mut ctx, 20160226100000).await.unwrap();
        assert!(!ledger.is_applied(&mut ctx, 20160226100000).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_version_is_reported() {
        let mut ctx = sqlite_context().await;
        let ledger = Ledger::new("custom_migrations");
        ledger.ensure(&mut ctx).await.unwrap();
        ctx.execute("INSERT INTO custom_migrations (version, batch) VALUES ('not-a-version', 1)")
            .await
            .unwrap();

        let err = ledger.applied(&mut ctx).await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidLedger(_)));
    }
}
