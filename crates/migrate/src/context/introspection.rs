//! Catalog introspection for guarded and idempotent migrations

use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::MigrationResult;
use crate::migrations::schema_builder::{IndexOptions, OnDelete};

use super::MigrationContext;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyInfo {
    /// SQLite does not report foreign key names
    pub name: Option<String>,
    pub column: String,
    pub to_table: String,
    pub to_column: String,
    pub on_delete: Option<OnDelete>,
}

/// Filter for `foreign_key_exists`; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForeignKeyFilter {
    pub column: Option<String>,
    pub name: Option<String>,
    pub on_delete: Option<OnDelete>,
}

impl ForeignKeyFilter {
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = Some(on_delete);
        self
    }

    pub(crate) fn matches(&self, fk: &ForeignKeyInfo) -> bool {
        self.column.as_deref().map_or(true, |c| fk.column == c)
            && self
                .name
                .as_deref()
                .map_or(true, |n| fk.name.as_deref() == Some(n))
            && self.on_delete.map_or(true, |d| fk.on_delete == Some(d))
    }
}

/// `schema.table` into its parts
fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn schema_param(schema: Option<&str>) -> DatabaseValue {
    DatabaseValue::from(schema.map(str::to_string))
}

fn text(value: Option<&DatabaseValue>) -> String {
    match value {
        Some(DatabaseValue::Text(s)) => s.clone(),
        Some(DatabaseValue::Int(i)) => i.to_string(),
        Some(DatabaseValue::Float(f)) => f.to_string(),
        Some(DatabaseValue::Bool(b)) => b.to_string(),
        Some(DatabaseValue::Null) | None => String::new(),
    }
}

impl MigrationContext {
    pub async fn table_exists(&mut self, table: &str) -> MigrationResult<bool> {
        let (schema, name) = split_table(table);
        let count = match self.dialect() {
            SqlDialect::PostgreSQL => {
                self.select_count(
                    "SELECT COUNT(*) FROM information_schema.tables \
                     WHERE table_schema = COALESCE($2, current_schema()) AND table_name = $1",
                    &[name.into(), schema_param(schema)],
                )
                .await?
            }
            SqlDialect::SQLite => {
                self.select_count(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    &[name.into()],
                )
                .await?
            }
        };
        Ok(count > 0)
    }

    /// Columns of a table in declaration order
    pub async fn columns(&mut self, table: &str) -> MigrationResult<Vec<ColumnInfo>> {
        let (schema, name) = split_table(table);
        let rows = match self.dialect() {
            SqlDialect::PostgreSQL => {
                self.select_all(
                    "SELECT column_name::text AS name, data_type::text AS data_type, \
                            (is_nullable::text = 'YES') AS nullable, column_default::text AS column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = COALESCE($2, current_schema()) AND table_name = $1 \
                     ORDER BY ordinal_position",
                    &[name.into(), schema_param(schema)],
                )
                .await?
            }
            SqlDialect::SQLite => {
                self.select_all(
                    "SELECT name, type AS data_type, (\"notnull\" = 0) AS nullable, dflt_value AS column_default \
                     FROM pragma_table_info(?1) ORDER BY cid",
                    &[name.into()],
                )
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: text(row.get("name")),
                data_type: text(row.get("data_type")),
                nullable: row.get_bool("nullable").unwrap_or(true),
                default: row
                    .get("column_default")
                    .filter(|v| !v.is_null())
                    .map(|v| text(Some(v))),
            })
            .collect())
    }

    pub async fn column_exists(&mut self, table: &str, column: &str) -> MigrationResult<bool> {
        Ok(self.columns(table).await?.iter().any(|c| c.name == column))
    }

    /// `None` when the column does not exist
    pub async fn column_is_nullable(&mut self, table: &str, column: &str) -> MigrationResult<Option<bool>> {
        Ok(self
            .columns(table)
            .await?
            .into_iter()
            .find(|c| c.name == column)
            .map(|c| c.nullable))
    }

    /// Indexes of a table with their columns in key order
    pub async fn indexes(&mut self, table: &str) -> MigrationResult<Vec<IndexInfo>> {
        let (schema, name) = split_table(table);
        match self.dialect() {
            SqlDialect::PostgreSQL => {
                let rows = self
                    .select_all(
                        "SELECT i.relname::text AS index_name, ix.indisunique AS is_unique, \
                                a.attname::text AS column_name \
                         FROM pg_index ix \
                         JOIN pg_class t ON t.oid = ix.indrelid \
                         JOIN pg_class i ON i.oid = ix.indexrelid \
                         JOIN pg_namespace n ON n.oid = t.relnamespace \
                         CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
                         LEFT JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
                         WHERE t.relname = $1 AND n.nspname = COALESCE($2, current_schema()) \
                         ORDER BY i.relname, k.ord",
                        &[name.into(), schema_param(schema)],
                    )
                    .await?;

                let mut indexes: Vec<IndexInfo> = Vec::new();
                for row in &rows {
                    let index_name = text(row.get("index_name"));
                    let column = row.get_str("column_name").map(str::to_string);

                    match indexes.last_mut() {
                        Some(last) if last.name == index_name => last.columns.extend(column),
                        _ => indexes.push(IndexInfo {
                            name: index_name,
                            columns: column.into_iter().collect(),
                            unique: row.get_bool("is_unique").unwrap_or(false),
                        }),
                    }
                }
                Ok(indexes)
            }
            SqlDialect::SQLite => {
                let list = self
                    .select_all(
                        "SELECT name, \"unique\" AS is_unique FROM pragma_index_list(?1)",
                        &[name.into()],
                    )
                    .await?;

                let mut indexes = Vec::with_capacity(list.len());
                for row in &list {
                    let index_name = text(row.get("name"));
                    let columns = self
                        .select_all(
                            "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
                            &[index_name.clone().into()],
                        )
                        .await?
                        .iter()
                        .filter_map(|c| c.get_str("name").map(str::to_string))
                        .collect();

                    indexes.push(IndexInfo {
                        name: index_name,
                        columns,
                        unique: row.get_bool("is_unique").unwrap_or(false),
                    });
                }
                indexes.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(indexes)
            }
        }
    }

    /// Whether an index covers exactly `columns`, in order.
    ///
    /// A name in `options` must match too, and `unique` requires a unique index.
    pub async fn index_exists(
        &mut self,
        table: &str,
        columns: &[&str],
        options: &IndexOptions,
    ) -> MigrationResult<bool> {
        Ok(self.indexes(table).await?.iter().any(|index| {
            index.columns.iter().map(String::as_str).eq(columns.iter().copied())
                && options.name.as_deref().map_or(true, |n| index.name == n)
                && (!options.unique || index.unique)
        }))
    }

    pub async fn index_exists_by_name(&mut self, table: &str, index: &str) -> MigrationResult<bool> {
        Ok(self.indexes(table).await?.iter().any(|i| i.name == index))
    }

    pub async fn foreign_keys(&mut self, table: &str) -> MigrationResult<Vec<ForeignKeyInfo>> {
        let (schema, name) = split_table(table);
        let rows = match self.dialect() {
            SqlDialect::PostgreSQL => {
                self.select_all(
                    "SELECT c.conname::text AS name, a.attname::text AS column_name, \
                            t2.relname::text AS to_table, a2.attname::text AS to_column, \
                            c.confdeltype::text AS on_delete \
                     FROM pg_constraint c \
                     JOIN pg_class t ON t.oid = c.conrelid \
                     JOIN pg_namespace n ON n.oid = t.relnamespace \
                     JOIN pg_class t2 ON t2.oid = c.confrelid \
                     JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = c.conkey[1] \
                     JOIN pg_attribute a2 ON a2.attrelid = c.confrelid AND a2.attnum = c.confkey[1] \
                     WHERE c.contype = 'f' AND t.relname = $1 AND n.nspname = COALESCE($2, current_schema()) \
                     ORDER BY c.conname",
                    &[name.into(), schema_param(schema)],
                )
                .await?
            }
            SqlDialect::SQLite => {
                self.select_all(
                    "SELECT NULL AS name, \"from\" AS column_name, \"table\" AS to_table, \
                            \"to\" AS to_column, on_delete \
                     FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
                    &[name.into()],
                )
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| ForeignKeyInfo {
                name: row.get_str("name").map(str::to_string),
                column: text(row.get("column_name")),
                to_table: text(row.get("to_table")),
                // SQLite leaves `to` empty for references to the primary key
                to_column: row
                    .get_str("to_column")
                    .filter(|c| !c.is_empty())
                    .unwrap_or("id")
                    .to_string(),
                on_delete: row.get_str("on_delete").and_then(OnDelete::from_catalog),
            })
            .collect())
    }

    /// Whether `source` has a foreign key, to `target` when given, matching `filter`
    pub async fn foreign_key_exists(
        &mut self,
        source: &str,
        target: Option<&str>,
        filter: &ForeignKeyFilter,
    ) -> MigrationResult<bool> {
        let target = target.map(|t| split_table(t).1);
        Ok(self.foreign_keys(source).await?.iter().any(|fk| {
            target.map_or(true, |t| fk.to_table == t) && filter.matches(fk)
        }))
    }

    pub async fn check_constraint_exists(&mut self, table: &str, constraint: &str) -> MigrationResult<bool> {
        let (schema, name) = split_table(table);
        let count = match self.dialect() {
            SqlDialect::PostgreSQL => {
                self.select_count(
                    "SELECT COUNT(*) FROM pg_constraint c \
                     JOIN pg_class t ON t.oid = c.conrelid \
                     JOIN pg_namespace n ON n.oid = t.relnamespace \
                     WHERE c.contype = 'c' AND c.conname = $1 AND t.relname = $2 \
                       AND n.nspname = COALESCE($3, current_schema())",
                    &[constraint.into(), name.into(), schema_param(schema)],
                )
                .await?
            }
            SqlDialect::SQLite => {
                let quoted = self.quote(constraint);
                self.select_count(
                    "SELECT COUNT(*) FROM sqlite_master \
                     WHERE type = 'table' AND name = ?1 AND sql LIKE '%CONSTRAINT ' || ?2 || ' %'",
                    &[name.into(), quoted.into()],
                )
                .await?
            }
        };
        Ok(count > 0)
    }
}
