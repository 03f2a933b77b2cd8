//! Migration System
//!
//! Typed and SQL-file migrations, the ledger of applied versions and the
//! runner that applies and rolls them back.

pub mod definitions;
pub mod ledger;
pub mod manager;
pub mod rollback;
pub mod runner;
pub mod schema_builder;
pub mod statements;

pub use definitions::{
    Migration, MigrationDirection, MigrationRecord, MigrationRunResult, MigrationStatus,
    MigrationStatusEntry, RollbackResult,
};
pub use ledger::{Ledger, DEFAULT_LEDGER_TABLE};
pub use manager::{MigrationManager, SqlMigration};
pub use rollback::RedoResult;
pub use runner::{Migrator, MigratorSettings};
pub use schema_builder::{
    ColumnOptions, ColumnType, DefaultValue, IndexOptions, OnDelete, TableBuilder,
};
pub use statements::split_sql_statements;
