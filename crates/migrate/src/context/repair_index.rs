//! Index repair
//!
//! Rebuilds an index that may be corrupt or missing. For unique indexes the
//! duplicate rows that would block the rebuild are resolved first: rows
//! referencing a duplicate are pointed at the kept row (the lowest id of
//! each tuple), then the duplicates are deleted or renamed. In dry-run mode
//! every write statement is logged and collected but not executed.

use std::collections::BTreeMap;

use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::{MigrationError, MigrationResult};
use crate::migrations::schema_builder::{create_index_sql, IndexOptions};

use super::MigrationContext;

/// Ids per `IN (...)` list
const REPAIR_BATCH_SIZE: usize = 100;
const DEFAULT_RENAME_MAX_LENGTH: usize = 255;
const DUPLICATE_SUFFIX: &str = "-dup-";

/// How a referencing column points at the repaired table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Plain foreign key column
    Column,
    /// Rows that would become duplicates on `column` after remapping are
    /// deleted instead of updated
    Deduplicated { column: String },
    /// `bigint[]` column holding ids (PostgreSQL only)
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReference {
    pub table: String,
    pub column: String,
    pub kind: ReferenceKind,
}

impl IndexReference {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            kind: ReferenceKind::Column,
        }
    }

    pub fn deduplicated_by(mut self, column: impl Into<String>) -> Self {
        self.kind = ReferenceKind::Deduplicated { column: column.into() };
        self
    }

    pub fn array(mut self) -> Self {
        self.kind = ReferenceKind::Array;
        self
    }
}

/// What happens to the duplicate rows themselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateAction {
    Delete,
    /// Append `-dup-<id>` to `column`, truncating to `max_length`
    Rename { column: String, max_length: usize },
}

/// Description of one index to repair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRepair {
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub references: Vec<IndexReference>,
    pub action: DuplicateAction,
    pub dry_run: bool,
}

impl IndexRepair {
    pub fn new(table: impl Into<String>, index: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            index: index.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            references: Vec::new(),
            action: DuplicateAction::Delete,
            dry_run: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn reference(mut self, reference: IndexReference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn rename_duplicates(mut self, column: impl Into<String>, max_length: Option<usize>) -> Self {
        self.action = DuplicateAction::Rename {
            column: column.into(),
            max_length: max_length.unwrap_or(DEFAULT_RENAME_MAX_LENGTH),
        };
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexRepairAction {
    #[default]
    TableMissing,
    Reindexed,
    Created,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexRepairReport {
    pub action: IndexRepairAction,
    /// Rows found duplicating a kept row
    pub duplicates: usize,
    /// Duplicate rows deleted or renamed
    pub rows_changed: u64,
    pub references_updated: u64,
    pub references_deleted: u64,
    /// Write statements in order, executed unless dry run
    pub statements: Vec<String>,
}

fn id_list(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
}

fn parse_id_list(value: &str) -> Vec<i64> {
    value
        .trim_matches(|c| c == '{' || c == '}')
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

impl MigrationContext {
    /// Resolve duplicates blocking `repair.index`, then rebuild or create it
    pub async fn repair_index(&mut self, repair: &IndexRepair) -> MigrationResult<IndexRepairReport> {
        self.ensure_no_transaction("repair_index")?;
        if repair.columns.is_empty() {
            return Err(MigrationError::InvalidArgument(
                "repair_index requires at least one column".to_string(),
            ));
        }

        let mut report = IndexRepairReport::default();
        if repair.dry_run {
            tracing::info!(table = %repair.table, index = %repair.index, "dry run, no changes will be made");
        }

        if !self.table_exists(&repair.table).await? {
            tracing::info!(table = %repair.table, "table does not exist, skipping index repair");
            return Ok(report);
        }

        if repair.unique {
            self.deduplicate_for_index(repair, &mut report).await?;
        }

        if self.index_exists_by_name(&repair.table, &repair.index).await? {
            let sql = match self.dialect() {
                SqlDialect::PostgreSQL => format!("REINDEX INDEX CONCURRENTLY {}", self.quote(&repair.index)),
                SqlDialect::SQLite => format!("REINDEX {}", self.quote(&repair.index)),
            };
            self.repair_write(&sql, repair.dry_run, &mut report).await?;
            report.action = IndexRepairAction::Reindexed;
        } else {
            let columns: Vec<&str> = repair.columns.iter().map(String::as_str).collect();
            let mut options = IndexOptions::new().name(repair.index.as_str());
            options.unique = repair.unique;
            let sql = create_index_sql(
                self.dialect(),
                &repair.table,
                &columns,
                &options,
                self.dialect().supports_concurrent_index(),
            );
            self.repair_write(&sql, repair.dry_run, &mut report).await?;
            report.action = IndexRepairAction::Created;
        }

        tracing::info!(
            table = %repair.table,
            index = %repair.index,
            action = ?report.action,
            duplicates = report.duplicates,
            dry_run = repair.dry_run,
            "index repair completed"
        );
        Ok(report)
    }

    /// Map every duplicate id to the lowest id sharing its non-null tuple
    async fn duplicate_id_mapping(&mut self, table: &str, columns: &[String]) -> MigrationResult<BTreeMap<i64, i64>> {
        let quoted = self.quote(table);
        let same_tuple = columns
            .iter()
            .map(|c| {
                let column = self.quote(c);
                format!("kept.{column} = dup.{column}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let not_null = columns
            .iter()
            .map(|c| format!("dup.{} IS NOT NULL", self.quote(c)))
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "SELECT dup.id AS id, MIN(kept.id) AS kept_id \
             FROM {quoted} dup JOIN {quoted} kept ON {same_tuple} AND kept.id < dup.id \
             WHERE {not_null} GROUP BY dup.id ORDER BY dup.id"
        );

        let mut mapping = BTreeMap::new();
        for row in self.select_all(&sql, &[]).await? {
            if let (Some(id), Some(kept)) = (row.get_i64("id"), row.get_i64("kept_id")) {
                mapping.insert(id, kept);
            }
        }
        Ok(mapping)
    }

    async fn deduplicate_for_index(
        &mut self,
        repair: &IndexRepair,
        report: &mut IndexRepairReport,
    ) -> MigrationResult<()> {
        let mapping = self.duplicate_id_mapping(&repair.table, &repair.columns).await?;
        report.duplicates = mapping.len();

        if mapping.is_empty() {
            tracing::info!(
                table = %repair.table,
                columns = %repair.columns.join(", "),
                "no duplicates found"
            );
            return Ok(());
        }

        tracing::warn!(
            table = %repair.table,
            columns = %repair.columns.join(", "),
            duplicates = mapping.len(),
            "found duplicate rows"
        );

        let bad_ids: Vec<i64> = mapping.keys().copied().collect();
        let quoted_table = self.quote(&repair.table);

        match &repair.action {
            DuplicateAction::Rename { column, max_length } => {
                let column = self.quote(column);
                let suffix = format!("'{}' || CAST(id AS TEXT)", DUPLICATE_SUFFIX);
                for chunk in bad_ids.chunks(REPAIR_BATCH_SIZE) {
                    let sql = format!(
                        "UPDATE {quoted_table} SET {column} = CASE \
                         WHEN LENGTH({column}) + LENGTH({suffix}) > {max_length} \
                         THEN SUBSTR({column}, 1, {max_length} - LENGTH({suffix})) || {suffix} \
                         ELSE {column} || {suffix} END \
                         WHERE id IN ({})",
                        id_list(chunk)
                    );
                    let changed = self.repair_write(&sql, repair.dry_run, report).await?;
                    report.rows_changed += changed;
                }
            }
            DuplicateAction::Delete => {
                for reference in &repair.references {
                    self.remap_reference(reference, &mapping, repair.dry_run, report).await?;
                }

                for chunk in bad_ids.chunks(REPAIR_BATCH_SIZE) {
                    let sql = format!("DELETE FROM {quoted_table} WHERE id IN ({})", id_list(chunk));
                    let changed = self.repair_write(&sql, repair.dry_run, report).await?;
                    report.rows_changed += changed;
                }
            }
        }
        Ok(())
    }

    async fn remap_reference(
        &mut self,
        reference: &IndexReference,
        mapping: &BTreeMap<i64, i64>,
        dry_run: bool,
        report: &mut IndexRepairReport,
    ) -> MigrationResult<()> {
        if !self.table_exists(&reference.table).await? {
            tracing::info!(table = %reference.table, "reference table does not exist, skipping");
            return Ok(());
        }

        let table = self.quote(&reference.table);
        let column = self.quote(&reference.column);

        match &reference.kind {
            ReferenceKind::Array => return self.remap_array_reference(reference, mapping, dry_run, report).await,
            ReferenceKind::Deduplicated { column: dedup } => {
                let dedup = self.quote(dedup);
                for (bad, good) in mapping {
                    let sql = format!(
                        "SELECT DISTINCT r.{dedup} AS value FROM {table} r \
                         WHERE r.{column} = {good} AND EXISTS (\
                         SELECT 1 FROM {table} sub WHERE sub.{dedup} = r.{dedup} AND sub.{column} = {bad})"
                    );
                    let values: Vec<DatabaseValue> = self
                        .select_all(&sql, &[])
                        .await?
                        .into_iter()
                        .filter_map(|row| row.get("value").cloned())
                        .filter(|v| !v.is_null())
                        .collect();

                    for chunk in values.chunks(REPAIR_BATCH_SIZE) {
                        let literals = chunk
                            .iter()
                            .map(|v| v.to_sql_literal(self.dialect()))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let sql = format!(
                            "DELETE FROM {table} WHERE {column} = {bad} AND {dedup} IN ({literals})"
                        );
                        let changed = self.repair_write(&sql, dry_run, report).await?;
                        report.references_deleted += changed;
                    }
                }
            }
            ReferenceKind::Column => {}
        }

        for (bad, good) in mapping {
            let sql = format!("UPDATE {table} SET {column} = {good} WHERE {column} = {bad}");
            let updated = self.repair_write(&sql, dry_run, report).await?;
            report.references_updated += updated;
            if !dry_run {
                tracing::info!(table = %reference.table, from = bad, to = good, updated, "updated references");
            }
        }
        Ok(())
    }

    async fn remap_array_reference(
        &mut self,
        reference: &IndexReference,
        mapping: &BTreeMap<i64, i64>,
        dry_run: bool,
        report: &mut IndexRepairReport,
    ) -> MigrationResult<()> {
        if self.dialect() != SqlDialect::PostgreSQL {
            return Err(MigrationError::unsupported("repair_index array references", self.dialect()));
        }

        let table = self.quote(&reference.table);
        let column = self.quote(&reference.column);
        let bad_ids: Vec<i64> = mapping.keys().copied().collect();

        for chunk in bad_ids.chunks(REPAIR_BATCH_SIZE) {
            let sql = format!(
                "SELECT id, array_to_string({column}, ',') AS ids FROM {table} \
                 WHERE {column}::bigint[] && ARRAY[{}]::bigint[]",
                id_list(chunk)
            );
            let records = self.select_all(&sql, &[]).await?;

            for record in &records {
                let Some(record_id) = record.get_i64("id") else {
                    continue;
                };
                let ids: Vec<i64> = parse_id_list(record.get_str("ids").unwrap_or_default())
                    .into_iter()
                    .map(|id| mapping.get(&id).copied().unwrap_or(id))
                    .collect();

                let sql = format!(
                    "UPDATE {table} SET {column} = ARRAY[{}]::bigint[] WHERE id = {record_id}",
                    id_list(&ids)
                );
                let changed = self.repair_write(&sql, dry_run, report).await?;
                report.references_updated += changed;
            }
        }
        Ok(())
    }

    /// Log and collect a write; run it with the statement timeout disabled unless dry run
    async fn repair_write(
        &mut self,
        sql: &str,
        dry_run: bool,
        report: &mut IndexRepairReport,
    ) -> MigrationResult<u64> {
        tracing::info!(sql = %sql, dry_run, "index repair statement");
        report.statements.push(sql.to_string());
        if dry_run {
            return Ok(0);
        }

        let statement = sql.to_string();
        self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&statement).await }))
            .await
    }
}
