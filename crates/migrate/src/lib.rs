//! # tidemark-migrate
//!
//! Versioned schema migrations for PostgreSQL and SQLite.
//!
//! Migrations implement [`Migration`] (or are loaded from SQL files by
//! [`MigrationManager`]) and are applied by a [`Migrator`], which records
//! each applied version in a ledger table. Migration bodies receive a
//! [`MigrationContext`] with the helpers for zero-downtime changes:
//! concurrent indexes, `NOT VALID` constraints, lock retries, batched
//! backfills and index repair.

pub mod backends;
pub mod context;
pub mod error;
pub mod migrations;

pub use backends::{connect, DatabaseConnection, DatabaseRow, DatabaseValue, SqlDialect};
pub use context::{
    BatchRange, BoxFuture, DuplicateAction, EachBatch, ForeignKeyFilter, ForeignKeyOptions,
    IndexReference, IndexRepair, IndexRepairAction, IndexRepairReport, LockRetryOptions,
    LockRetryTiming, MigrationContext, ReferenceKind, TimestampOptions, UpdateInBatchesOptions,
};
pub use error::{MigrationError, MigrationResult};
pub use migrations::{
    ColumnOptions, ColumnType, DefaultValue, IndexOptions, Migration, MigrationDirection,
    MigrationManager, MigrationRecord, MigrationRunResult, MigrationStatus, MigrationStatusEntry,
    Migrator, MigratorSettings, OnDelete, RedoResult, RollbackResult, SqlMigration, TableBuilder,
};

/// Re-exported so migrations can implement [`Migration`] without a direct dependency
pub use async_trait::async_trait;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
