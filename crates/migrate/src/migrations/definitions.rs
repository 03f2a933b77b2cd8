//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the `Migration` trait implemented by typed and SQL-file
//! migrations, plus the records and results reported by the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::MigrationContext;
use crate::error::{MigrationError, MigrationResult};

/// A versioned schema change
#[async_trait]
pub trait Migration: Send + Sync {
    /// 14-digit timestamp version, e.g. `20170622135728`
    fn version(&self) -> i64;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Whether the runner wraps `up`/`down` in a transaction.
    ///
    /// Return `false` for migrations that create indexes concurrently or
    /// manage their own transactions with lock retries.
    fn ddl_transaction(&self) -> bool {
        true
    }

    /// Schema scope this migration is restricted to, if any.
    ///
    /// The runner records restricted migrations without running them when
    /// the scope is not in the configured allow list.
    fn restriction(&self) -> Option<&str> {
        None
    }

    /// Apply the change
    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()>;

    /// Revert the change
    async fn down(&self, _ctx: &mut MigrationContext) -> MigrationResult<()> {
        Err(MigrationError::Irreversible {
            version: self.version(),
            name: self.name().to_string(),
        })
    }
}

/// Migration status in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
    /// Batch number (for grouping migrations)
    pub batch: i32,
}

/// Result of running migrations
#[derive(Debug, Default, Serialize)]
pub struct MigrationRunResult {
    /// Number of migrations that were applied
    pub applied_count: usize,
    /// Versions of migrations that were applied
    pub applied_migrations: Vec<i64>,
    /// Number of migrations that were skipped (already applied or above the target)
    pub skipped_count: usize,
    /// Batch the applied migrations were recorded under
    pub batch: Option<i32>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Result of rolling back migrations
#[derive(Debug, Default, Serialize)]
pub struct RollbackResult {
    /// Number of migrations that were rolled back
    pub rolled_back_count: usize,
    /// Versions of migrations that were rolled back, newest first
    pub rolled_back_migrations: Vec<i64>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Apply the migration (run `up`)
    Up,
    /// Rollback the migration (run `down`)
    Down,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied {
        /// When it was applied
        applied_at: DateTime<Utc>,
        /// Batch number
        batch: i32,
    },
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, MigrationStatus::Applied { .. })
    }
}

/// One line of `status()` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub version: i64,
    /// `None` when the ledger holds a version no known migration defines
    pub name: Option<String>,
    pub status: MigrationStatus,
}
