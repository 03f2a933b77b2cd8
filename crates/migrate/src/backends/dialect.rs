//! SQL dialect rendering rules

use std::fmt;

/// SQL dialect enumeration for the supported databases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder for a 1-based index
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index),
            SqlDialect::SQLite => format!("?{}", index),
        }
    }

    /// Quote an identifier, splitting schema-qualified names on `.`
    pub fn quote_ident(&self, name: &str) -> String {
        name.split('.')
            .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a string literal
    pub fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    pub fn true_value(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "TRUE",
            SqlDialect::SQLite => "1",
        }
    }

    pub fn false_value(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "FALSE",
            SqlDialect::SQLite => "0",
        }
    }

    /// Column definition for an auto-incrementing primary key
    pub fn primary_key(&self, big: bool) -> &'static str {
        match (self, big) {
            (SqlDialect::PostgreSQL, false) => "serial PRIMARY KEY",
            (SqlDialect::PostgreSQL, true) => "bigserial PRIMARY KEY",
            (SqlDialect::SQLite, _) => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    pub fn supports_concurrent_index(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }

    /// `NOT VALID` constraints followed by a separate `VALIDATE CONSTRAINT`
    pub fn supports_not_valid(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }

    pub fn supports_lock_timeout(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }

    pub fn supports_statement_timeout(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }

    pub fn supports_advisory_locks(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }

    /// `ALTER TABLE ... ADD/DROP CONSTRAINT` and `ALTER COLUMN` forms
    pub fn supports_alter_constraints(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::PostgreSQL => write!(f, "PostgreSQL"),
            SqlDialect::SQLite => write!(f, "SQLite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(SqlDialect::PostgreSQL.placeholder(1), "$1");
        assert_eq!(SqlDialect::SQLite.placeholder(3), "?3");
    }

    #[test]
    fn test_identifier_quoting() {
        let dialect = SqlDialect::PostgreSQL;
        assert_eq!(dialect.quote_ident("ci_variables"), "\"ci_variables\"");
        assert_eq!(dialect.quote_ident("public.snippets"), "\"public\".\"snippets\"");
        assert_eq!(dialect.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_capabilities() {
        assert!(SqlDialect::PostgreSQL.supports_concurrent_index());
        assert!(!SqlDialect::SQLite.supports_concurrent_index());
        assert!(!SqlDialect::SQLite.supports_advisory_locks());
        assert_eq!(SqlDialect::SQLite.to_string(), "SQLite");
    }
}
