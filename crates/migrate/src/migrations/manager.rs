//! Migration Manager - File system operations for migrations
//!
//! Handles creating, loading, and parsing `<version>_<name>.sql` migration
//! files. A file looks like:
//!
//! ```sql
//! -- disable_ddl_transaction
//! -- restrict_to: main
//!
//! -- Up migration
//! CREATE INDEX CONCURRENTLY index_users_on_email ON users (email);
//!
//! -- Down migration
//! DROP INDEX CONCURRENTLY index_users_on_email;
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::definitions::Migration;
use super::statements::split_sql_statements;
use crate::context::MigrationContext;
use crate::error::{MigrationError, MigrationResult};

const DISABLE_DDL_TRANSACTION_DIRECTIVE: &str = "disable_ddl_transaction";
const RESTRICT_TO_DIRECTIVE: &str = "restrict_to:";

/// A migration defined by an SQL file
#[derive(Debug, Clone, PartialEq)]
pub struct SqlMigration {
    pub version: i64,
    pub name: String,
    pub up_sql: String,
    /// `None` when the file has no down section, making it irreversible
    pub down_sql: Option<String>,
    pub ddl_transaction: bool,
    pub restriction: Option<String>,
    pub path: Option<PathBuf>,
}

impl SqlMigration {
    /// Parse migration content to extract sections and directives
    pub fn parse(version: i64, name: impl Into<String>, content: &str) -> Self {
        let mut up_lines = Vec::new();
        let mut down_lines: Option<Vec<&str>> = None;
        let mut ddl_transaction = true;
        let mut restriction = None;
        let mut quote = DollarQuote::default();

        for line in content.lines() {
            if quote.is_open() {
                quote.scan(line);
                match down_lines.as_mut() {
                    Some(lines) => lines.push(line),
                    None => up_lines.push(line),
                }
                continue;
            }

            match section_marker(line) {
                Some(Section::Up) => {
                    continue;
                }
                Some(Section::Down) => {
                    down_lines = Some(Vec::new());
                    continue;
                }
                None => {}
            }

            if let Some(directive) = comment_body(line) {
                let lowered = directive.to_lowercase();
                if lowered == DISABLE_DDL_TRANSACTION_DIRECTIVE {
                    ddl_transaction = false;
                    continue;
                }
                if lowered.starts_with(RESTRICT_TO_DIRECTIVE) {
                    let scope = directive
                        .get(RESTRICT_TO_DIRECTIVE.len()..)
                        .unwrap_or_default()
                        .trim();
                    if !scope.is_empty() {
                        restriction = Some(scope.to_string());
                    }
                    continue;
                }
            }

            quote.scan(line);
            match down_lines.as_mut() {
                Some(lines) => lines.push(line),
                None => up_lines.push(line),
            }
        }

        Self {
            version,
            name: name.into(),
            up_sql: up_lines.join("\n").trim().to_string(),
            down_sql: down_lines.map(|lines| lines.join("\n").trim().to_string()),
            ddl_transaction,
            restriction,
            path: None,
        }
    }

    async fn run_script(&self, ctx: &mut MigrationContext, sql: &str) -> MigrationResult<()> {
        for statement in split_sql_statements(sql, ctx.dialect()) {
            ctx.execute(&statement).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ddl_transaction(&self) -> bool {
        self.ddl_transaction
    }

    fn restriction(&self) -> Option<&str> {
        self.restriction.as_deref()
    }

    async fn up(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        self.run_script(ctx, &self.up_sql).await
    }

    async fn down(&self, ctx: &mut MigrationContext) -> MigrationResult<()> {
        match &self.down_sql {
            Some(sql) => self.run_script(ctx, sql).await,
            None => Err(MigrationError::Irreversible {
                version: self.version,
                name: self.name.clone(),
            }),
        }
    }
}

enum Section {
    Up,
    Down,
}

/// Text after `--` on a whole-line comment
fn comment_body(line: &str) -> Option<&str> {
    line.trim().strip_prefix("--").map(str::trim)
}

fn section_marker(line: &str) -> Option<Section> {
    let body = comment_body(line)?.to_lowercase();
    let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match normalized.as_str() {
        "up migration" | "migrate:up" => Some(Section::Up),
        "down migration" | "migrate:down" => Some(Section::Down),
        _ => None,
    }
}

/// Line-by-line tracker of PostgreSQL dollar-quoted bodies, so comment
/// lines inside a function body are never read as markers
#[derive(Debug, Default)]
struct DollarQuote {
    open: Option<String>,
}

impl DollarQuote {
    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn scan(&mut self, line: &str) {
        let mut rest = line;
        loop {
            if let Some(tag) = &self.open {
                match rest.find(tag.as_str()) {
                    Some(pos) => {
                        rest = &rest[pos + tag.len()..];
                        self.open = None;
                        continue;
                    }
                    None => return,
                }
            }

            let Some(pos) = rest.find(&['$', '\'', '-'][..]) else {
                return;
            };
            let tail = &rest[pos..];
            if tail.starts_with("--") {
                return;
            }
            if let Some(literal) = tail.strip_prefix('\'') {
                // a doubled quote reads as two adjacent literals
                match literal.find('\'') {
                    Some(end) => rest = &literal[end + 1..],
                    None => return,
                }
                continue;
            }
            match dollar_tag(tail) {
                Some(tag) => {
                    self.open = Some(tag.to_string());
                    rest = &tail[tag.len()..];
                }
                None => rest = &tail[1..],
            }
        }
    }
}

/// The `$$` or `$name$` opening `s`, if any
fn dollar_tag(s: &str) -> Option<&str> {
    let body = s.strip_prefix('$')?;
    let end = body.find('$')?;
    let valid = body[..end]
        .chars()
        .enumerate()
        .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
    valid.then(|| &s[..end + 2])
}

/// Migration manager for creating and loading SQL migrations
pub struct MigrationManager {
    migrations_dir: PathBuf,
}

impl MigrationManager {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Create a new migration file and return its path
    pub fn create_migration(&self, name: &str) -> MigrationResult<PathBuf> {
        let snake = to_snake_case(name);
        if snake.is_empty() {
            return Err(MigrationError::InvalidArgument(format!(
                "'{}' is not a usable migration name",
                name
            )));
        }

        fs::create_dir_all(&self.migrations_dir)?;

        let version = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let filename = format!("{}_{}.sql", version, snake);
        let filepath = self.migrations_dir.join(&filename);

        if filepath.exists() {
            return Err(MigrationError::InvalidMigration(format!(
                "{} already exists",
                filepath.display()
            )));
        }

        fs::write(&filepath, migration_template(&snake, &version))?;
        tracing::info!(path = %filepath.display(), "created migration");

        Ok(filepath)
    }

    /// Load all migration files from the migrations directory, sorted by version
    pub fn load_migrations(&self) -> MigrationResult<Vec<SqlMigration>> {
        if !self.migrations_dir.exists() {
            return Ok(Vec::new());
        }

        let mut migrations = Vec::new();
        let mut seen: HashMap<i64, String> = HashMap::new();

        for entry in fs::read_dir(&self.migrations_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "sql") {
                continue;
            }

            let migration = self.parse_migration_file(&path)?;
            let file_name = file_name(&path);

            if let Some(first) = seen.insert(migration.version, file_name.clone()) {
                return Err(MigrationError::DuplicateVersion {
                    version: migration.version,
                    first,
                    second: file_name,
                });
            }

            migrations.push(migration);
        }

        migrations.sort_by_key(|m| m.version);
        Ok(migrations)
    }

    /// Parse a migration file into an SqlMigration
    pub fn parse_migration_file(&self, path: &Path) -> MigrationResult<SqlMigration> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MigrationError::InvalidMigration(format!("invalid file name {}", path.display())))?;

        let (version, name) = parse_file_stem(stem).ok_or_else(|| {
            MigrationError::InvalidMigration(format!(
                "{} must be named <version>_<name>.sql",
                file_name(path)
            ))
        })?;

        let content = fs::read_to_string(path)?;
        let mut migration = SqlMigration::parse(version, name, &content);
        migration.path = Some(path.to_path_buf());

        Ok(migration)
    }
}

/// Split `20240101120000_add_index` into its version and name
fn parse_file_stem(stem: &str) -> Option<(i64, String)> {
    let digits = stem.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }

    let version = stem[..digits].parse::<i64>().ok()?;
    let name = stem[digits..].strip_prefix('_')?;
    if name.is_empty() {
        return None;
    }

    Some((version, name.to_string()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `AddIndexToUsers`, `add index to users` and `add-index-to-users` all
/// become `add_index_to_users`
fn to_snake_case(name: &str) -> String {
    let mut out = String::new();
    let mut prev_lower_or_digit = false;

    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower_or_digit {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower_or_digit = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }

    out.trim_matches('_').to_string()
}

fn migration_template(name: &str, version: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\
         --\n\
         -- Uncomment to run outside a transaction (required for CONCURRENTLY):\n\
         -- -- disable_ddl_transaction\n\n\
         -- Up migration\n\
         -- Add your schema changes here\n\n\n\
         -- Down migration\n\
         -- Add rollback statements here\n",
        name,
        version,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_sections_and_directives() {
        let content = "-- disable_ddl_transaction\n\
                       -- restrict_to: main\n\
                       -- Up migration\n\
                       CREATE INDEX CONCURRENTLY idx ON users (email);\n\
                       -- Down migration\n\
                       DROP INDEX CONCURRENTLY idx;\n";

        let migration = SqlMigration::parse(20240101000000, "add_index", content);
        assert!(!migration.ddl_transaction);
        assert_eq!(migration.restriction.as_deref(), Some("main"));
        assert_eq!(migration.up_sql, "CREATE INDEX CONCURRENTLY idx ON users (email);");
        assert_eq!(migration.down_sql.as_deref(), Some("DROP INDEX CONCURRENTLY idx;"));
    }

    #[test]
    fn test_marker_must_be_whole_line() {
        let content = "-- migrate:up\n\
                       CREATE TABLE t (id integer); -- Down migration\n\
                       -- not a Down migration marker\n";

        let migration = SqlMigration::parse(1, "t", content);
        assert!(migration.down_sql.is_none());
        assert!(migration.up_sql.contains("CREATE TABLE t"));
    }

    #[test]
    fn test_markers_inside_function_body_are_sql() {
        let content = "-- migrate:up\n\
                       CREATE FUNCTION touch() RETURNS trigger AS $$\n\
                       BEGIN\n\
                       -- migrate:down\n\
                       -- disable_ddl_transaction\n\
                       RETURN NEW;\n\
                       END;\n\
                       $$ LANGUAGE plpgsql;\n\
                       CREATE FUNCTION noop() RETURNS void AS $body$ SELECT '$$' $body$ LANGUAGE sql;\n\
                       -- migrate:down\n\
                       DROP FUNCTION noop();\n\
                       DROP FUNCTION touch();\n";

        let migration = SqlMigration::parse(1, "touch", content);
        assert!(migration.ddl_transaction);
        assert!(migration.up_sql.contains("-- migrate:down\n-- disable_ddl_transaction\nRETURN NEW;"));
        assert!(migration.up_sql.ends_with("LANGUAGE sql;"));
        assert_eq!(
            migration.down_sql.as_deref(),
            Some("DROP FUNCTION noop();\nDROP FUNCTION touch();")
        );
    }

    #[test]
    fn test_dollar_quote_tracking() {
        let mut quote = DollarQuote::default();
        quote.scan("SELECT $1, 'costs $5' -- $$ in a comment");
        assert!(!quote.is_open());

        quote.scan("DO $fn$ BEGIN");
        assert!(quote.is_open());
        quote.scan("  PERFORM 1; $$ is not the closing tag");
        assert!(quote.is_open());
        quote.scan("END $fn$;");
        assert!(!quote.is_open());
    }

    #[test]
    fn test_empty_down_section_is_noop() {
        let migration = SqlMigration::parse(1, "t", "-- Up migration\nSELECT 1;\n-- DOWN MIGRATION\n");
        assert_eq!(migration.down_sql.as_deref(), Some(""));
    }

    #[test]
    fn test_parse_file_stem() {
        assert_eq!(
            parse_file_stem("20170622135728_add_unique_index"),
            Some((20170622135728, "add_unique_index".to_string()))
        );
        assert_eq!(parse_file_stem("add_index"), None);
        assert_eq!(parse_file_stem("20170622135728"), None);
        assert_eq!(parse_file_stem("20170622135728-add"), None);
    }

    #[test]
    fn test_snake_case_names() {
        assert_eq!(to_snake_case("AddIndexToUsers"), "add_index_to_users");
        assert_eq!(to_snake_case("add index to users"), "add_index_to_users");
        assert_eq!(to_snake_case("  add--index  "), "add_index");
        assert_eq!(to_snake_case("!!!"), "");
    }

    #[test]
    fn test_create_and_load_migration() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationManager::new(dir.path().join("db/migrate"));

        let path = manager.create_migration("Add Index To Users").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with("_add_index_to_users.sql"));
        assert_eq!(name.len(), "20240101000000_add_index_to_users.sql".len());

        let migrations = manager.load_migrations().unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name, "add_index_to_users");
        assert!(migrations[0].ddl_transaction);
        assert_eq!(migrations[0].down_sql.as_deref(), Some("-- Add rollback statements here"));
    }

    #[test]
    fn test_load_sorts_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20240102000000_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("20240101000000_first.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let manager = MigrationManager::new(dir.path());
        let versions: Vec<i64> = manager
            .load_migrations()
            .unwrap()
            .iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(versions, vec![20240101000000, 20240102000000]);

        fs::write(dir.path().join("20240101000000_again.sql"), "SELECT 3;").unwrap();
        let err = manager.load_migrations().unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateVersion { version: 20240101000000, .. }));
    }

    #[test]
    fn test_unparsable_file_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("add_index.sql"), "SELECT 1;").unwrap();

        let err = MigrationManager::new(dir.path()).load_migrations().unwrap_err();
        assert!(matches!(err, MigrationError::InvalidMigration(_)));
    }

    #[test]
    fn test_missing_directory_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationManager::new(dir.path().join("absent"));
        assert!(manager.load_migrations().unwrap().is_empty());
    }
}
