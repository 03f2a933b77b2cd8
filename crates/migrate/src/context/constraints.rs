//! Check constraint helpers and constraint naming

use sha2::{Digest, Sha256};

use crate::error::{MigrationError, MigrationResult};

use super::MigrationContext;

/// First ten hex characters of the SHA-256 of `identifier`
fn hashed_identifier(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(10);
    hex
}

/// Name for a foreign key added with `add_concurrent_foreign_key`.
///
/// Identifiers are capped at 63 bytes, so the table and column are hashed
/// rather than concatenated.
pub fn concurrent_foreign_key_name(table: &str, column: &str, prefix: &str) -> String {
    format!("{}{}", prefix, hashed_identifier(&format!("{}_{}_fk", table, column)))
}

/// Name for a check constraint of `kind` (e.g. `max_length`, `not_null`) on a column
pub fn check_constraint_name(table: &str, column: &str, kind: &str) -> String {
    format!(
        "check_{}",
        hashed_identifier(&format!("{}_{}_check_{}", table, column, kind))
    )
}

fn text_limit_name(table: &str, column: &str, name: Option<&str>) -> String {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => check_constraint_name(table, column, "max_length"),
    }
}

fn not_null_constraint_name(table: &str, column: &str, name: Option<&str>) -> String {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => check_constraint_name(table, column, "not_null"),
    }
}

impl MigrationContext {
    /// Add a `NOT VALID` check constraint, validating it when `validate` is set.
    ///
    /// The constraint is enforced for new rows as soon as it exists; an
    /// existing constraint of the same name is left alone.
    pub async fn add_check_constraint(
        &mut self,
        table: &str,
        check: &str,
        constraint: &str,
        validate: bool,
    ) -> MigrationResult<()> {
        self.ensure_no_transaction("add_check_constraint")?;
        if !self.dialect().supports_not_valid() {
            return Err(MigrationError::unsupported("add_check_constraint", self.dialect()));
        }

        if self.check_constraint_exists(table, constraint).await? {
            tracing::warn!(
                table,
                check,
                constraint,
                "check constraint was not created because it exists already"
            );
        } else {
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ( {} ) NOT VALID",
                self.quote(table),
                self.quote(constraint),
                check
            );
            self.with_lock_retries(|ctx| {
                let sql = sql.clone();
                Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) })
            })
            .await?;
        }

        if validate {
            self.validate_check_constraint(table, constraint).await?;
        }
        Ok(())
    }

    pub async fn validate_check_constraint(&mut self, table: &str, constraint: &str) -> MigrationResult<()> {
        if !self.check_constraint_exists(table, constraint).await? {
            return Err(MigrationError::missing_schema_object(
                table,
                "check constraint",
                constraint,
            ));
        }

        let sql = format!(
            "ALTER TABLE {} VALIDATE CONSTRAINT {}",
            self.quote(table),
            self.quote(constraint)
        );
        self.disable_statement_timeout(|ctx| Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) }))
            .await
    }

    pub async fn remove_check_constraint(&mut self, table: &str, constraint: &str) -> MigrationResult<()> {
        if !self.dialect().supports_alter_constraints() {
            return Err(MigrationError::unsupported("remove_check_constraint", self.dialect()));
        }

        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            self.quote(table),
            self.quote(constraint)
        );
        self.with_lock_retries(|ctx| {
            let sql = sql.clone();
            Box::pin(async move { ctx.execute(&sql).await.map(|_| ()) })
        })
        .await
    }

    /// Limit a text column to `limit` characters with a check constraint
    pub async fn add_text_limit(
        &mut self,
        table: &str,
        column: &str,
        limit: u32,
        constraint: Option<&str>,
        validate: bool,
    ) -> MigrationResult<()> {
        let check = format!("char_length({}) <= {}", self.quote(column), limit);
        let name = text_limit_name(table, column, constraint);
        self.add_check_constraint(table, &check, &name, validate).await
    }

    pub async fn validate_text_limit(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<()> {
        let name = text_limit_name(table, column, constraint);
        self.validate_check_constraint(table, &name).await
    }

    pub async fn remove_text_limit(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<()> {
        let name = text_limit_name(table, column, constraint);
        self.remove_check_constraint(table, &name).await
    }

    pub async fn check_text_limit_exists(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<bool> {
        let name = text_limit_name(table, column, constraint);
        self.check_constraint_exists(table, &name).await
    }

    /// Add an `IS NOT NULL` check constraint unless the column is already `NOT NULL`
    pub async fn add_not_null_constraint(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
        validate: bool,
    ) -> MigrationResult<()> {
        if self.column_is_nullable(table, column).await? == Some(false) {
            tracing::warn!(
                table,
                column,
                "NOT NULL check constraint was not created: column is already NOT NULL"
            );
            return Ok(());
        }

        let check = format!("{} IS NOT NULL", self.quote(column));
        let name = not_null_constraint_name(table, column, constraint);
        self.add_check_constraint(table, &check, &name, validate).await
    }

    pub async fn validate_not_null_constraint(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<()> {
        let name = not_null_constraint_name(table, column, constraint);
        self.validate_check_constraint(table, &name).await
    }

    pub async fn remove_not_null_constraint(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<()> {
        let name = not_null_constraint_name(table, column, constraint);
        self.remove_check_constraint(table, &name).await
    }

    pub async fn check_not_null_constraint_exists(
        &mut self,
        table: &str,
        column: &str,
        constraint: Option<&str>,
    ) -> MigrationResult<bool> {
        let name = not_null_constraint_name(table, column, constraint);
        self.check_constraint_exists(table, &name).await
    }
}
