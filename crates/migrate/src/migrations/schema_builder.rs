//! Schema Builder - DSL for creating database schema changes
//!
//! Renders dialect-aware column types, defaults, `CREATE TABLE` and
//! `CREATE INDEX` statements for the migration context helpers.

use crate::backends::SqlDialect;

/// Column types understood by the schema helpers
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Integer,
    BigInt,
    SmallInt,
    Boolean,
    /// `character varying`, optionally limited
    String(Option<u32>),
    Text,
    Float,
    Decimal { precision: u32, scale: u32 },
    DateTime,
    DateTimeWithTimezone,
    JsonB,
}

impl ColumnType {
    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        match (self, dialect) {
            (ColumnType::Integer, _) => "integer".to_string(),
            (ColumnType::BigInt, _) => "bigint".to_string(),
            (ColumnType::SmallInt, _) => "smallint".to_string(),
            (ColumnType::Boolean, _) => "boolean".to_string(),
            (ColumnType::String(Some(limit)), _) => format!("character varying({})", limit),
            (ColumnType::String(None), _) => "character varying".to_string(),
            (ColumnType::Text, _) => "text".to_string(),
            (ColumnType::Float, SqlDialect::PostgreSQL) => "double precision".to_string(),
            (ColumnType::Float, SqlDialect::SQLite) => "real".to_string(),
            (ColumnType::Decimal { precision, scale }, _) => format!("numeric({}, {})", precision, scale),
            (ColumnType::DateTime, SqlDialect::PostgreSQL) => "timestamp without time zone".to_string(),
            (ColumnType::DateTimeWithTimezone, SqlDialect::PostgreSQL) => "timestamp with time zone".to_string(),
            (ColumnType::DateTime | ColumnType::DateTimeWithTimezone, SqlDialect::SQLite) => "datetime".to_string(),
            (ColumnType::JsonB, SqlDialect::PostgreSQL) => "jsonb".to_string(),
            (ColumnType::JsonB, SqlDialect::SQLite) => "text".to_string(),
        }
    }
}

/// Column default value
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Raw SQL expression such as `CURRENT_TIMESTAMP`
    Expression(String),
}

impl DefaultValue {
    pub fn to_sql(&self, dialect: SqlDialect) -> String {
        match self {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Bool(true) => dialect.true_value().to_string(),
            DefaultValue::Bool(false) => dialect.false_value().to_string(),
            DefaultValue::Int(i) => i.to_string(),
            DefaultValue::Float(f) => f.to_string(),
            DefaultValue::Text(s) => dialect.quote_literal(s),
            DefaultValue::Expression(expr) => expr.clone(),
        }
    }
}

impl From<bool> for DefaultValue {
    fn from(value: bool) -> Self {
        DefaultValue::Bool(value)
    }
}

impl From<i32> for DefaultValue {
    fn from(value: i32) -> Self {
        DefaultValue::Int(i64::from(value))
    }
}

impl From<i64> for DefaultValue {
    fn from(value: i64) -> Self {
        DefaultValue::Int(value)
    }
}

impl From<&str> for DefaultValue {
    fn from(value: &str) -> Self {
        DefaultValue::Text(value.to_string())
    }
}

/// Nullability and default of a column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOptions {
    pub null: bool,
    pub default: Option<DefaultValue>,
}

impl Default for ColumnOptions {
    fn default() -> Self {
        Self {
            null: true,
            default: None,
        }
    }
}

impl ColumnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_null(mut self) -> Self {
        self.null = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<DefaultValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Action taken on referencing rows when the referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl OnDelete {
    pub fn to_sql(&self) -> &'static str {
        match self {
            OnDelete::NoAction => "ON DELETE NO ACTION",
            OnDelete::Restrict => "ON DELETE RESTRICT",
            OnDelete::Cascade => "ON DELETE CASCADE",
            OnDelete::SetNull => "ON DELETE SET NULL",
            OnDelete::SetDefault => "ON DELETE SET DEFAULT",
        }
    }

    /// Parse PostgreSQL `confdeltype` codes and SQLite `on_delete` strings
    pub fn from_catalog(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "A" | "NO ACTION" => Some(OnDelete::NoAction),
            "R" | "RESTRICT" => Some(OnDelete::Restrict),
            "C" | "CASCADE" => Some(OnDelete::Cascade),
            "N" | "SET NULL" => Some(OnDelete::SetNull),
            "D" | "SET DEFAULT" => Some(OnDelete::SetDefault),
            _ => None,
        }
    }
}

/// Index naming, uniqueness and partial-index condition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

impl IndexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn where_clause(mut self, condition: impl Into<String>) -> Self {
        self.where_clause = Some(condition.into());
        self
    }
}

/// Default index name, `index_<table>_on_<col>_and_<col>`
pub fn index_name(table: &str, columns: &[&str]) -> String {
    let table = table.rsplit('.').next().unwrap_or(table);
    format!("index_{}_on_{}", table, columns.join("_and_"))
}

/// Render a `CREATE INDEX` statement
pub fn create_index_sql(
    dialect: SqlDialect,
    table: &str,
    columns: &[&str],
    options: &IndexOptions,
    concurrently: bool,
) -> String {
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| index_name(table, columns));
    let quoted_columns = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "CREATE {}INDEX {}{} ON {} ({})",
        if options.unique { "UNIQUE " } else { "" },
        if concurrently { "CONCURRENTLY " } else { "" },
        dialect.quote_ident(&name),
        dialect.quote_ident(table),
        quoted_columns
    );

    if let Some(condition) = &options.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(condition);
    }

    sql
}

/// Render a `DROP INDEX` statement
pub fn drop_index_sql(dialect: SqlDialect, name: &str, concurrently: bool) -> String {
    format!(
        "DROP INDEX {}{}",
        if concurrently { "CONCURRENTLY " } else { "" },
        dialect.quote_ident(name)
    )
}

/// Render a column definition for `CREATE TABLE` or `ADD COLUMN`
pub fn column_definition_sql(
    dialect: SqlDialect,
    name: &str,
    column_type: &ColumnType,
    options: &ColumnOptions,
) -> String {
    let mut sql = format!("{} {}", dialect.quote_ident(name), column_type.to_sql(dialect));

    if let Some(default) = &options.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default.to_sql(dialect));
    }

    if !options.null {
        sql.push_str(" NOT NULL");
    }

    sql
}

#[derive(Debug, Clone)]
enum ColumnKind {
    PrimaryKey { big: bool },
    Typed(ColumnType),
}

/// A column being declared inside `create_table`
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    name: String,
    kind: ColumnKind,
    options: ColumnOptions,
}

impl ColumnDefinition {
    pub fn not_null(&mut self) -> &mut Self {
        self.options.null = false;
        self
    }

    pub fn null(&mut self, null: bool) -> &mut Self {
        self.options.null = null;
        self
    }

    pub fn default_value(&mut self, value: impl Into<DefaultValue>) -> &mut Self {
        self.options.default = Some(value.into());
        self
    }

    fn to_sql(&self, dialect: SqlDialect) -> String {
        match &self.kind {
            ColumnKind::PrimaryKey { big } => {
                format!("{} {}", dialect.quote_ident(&self.name), dialect.primary_key(*big))
            }
            ColumnKind::Typed(column_type) => {
                column_definition_sql(dialect, &self.name, column_type, &self.options)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum TableConstraint {
    Unique(Vec<String>),
    ForeignKey {
        column: String,
        table: String,
        column_ref: String,
        on_delete: Option<OnDelete>,
    },
}

/// Table builder for CREATE TABLE statements
#[derive(Debug, Clone)]
pub struct TableBuilder {
    table_name: String,
    if_not_exists: bool,
    columns: Vec<ColumnDefinition>,
    constraints: Vec<TableConstraint>,
    indexes: Vec<(Vec<String>, IndexOptions)>,
}

impl TableBuilder {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            if_not_exists: false,
            columns: Vec::new(),
            constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn if_not_exists(&mut self) -> &mut Self {
        self.if_not_exists = true;
        self
    }

    fn push(&mut self, name: &str, kind: ColumnKind) -> &mut ColumnDefinition {
        let index = self.columns.len();
        self.columns.push(ColumnDefinition {
            name: name.to_string(),
            kind,
            options: ColumnOptions::default(),
        });
        &mut self.columns[index]
    }

    /// Add an `id` auto-increment primary key
    pub fn id(&mut self) -> &mut ColumnDefinition {
        self.push("id", ColumnKind::PrimaryKey { big: false })
    }

    /// Add a 64-bit `id` auto-increment primary key
    pub fn bigint_id(&mut self) -> &mut ColumnDefinition {
        self.push("id", ColumnKind::PrimaryKey { big: true })
    }

    /// Add a column
    pub fn column(&mut self, name: &str, column_type: ColumnType) -> &mut ColumnDefinition {
        self.push(name, ColumnKind::Typed(column_type))
    }

    pub fn string(&mut self, name: &str, limit: Option<u32>) -> &mut ColumnDefinition {
        self.column(name, ColumnType::String(limit))
    }

    pub fn text(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::Text)
    }

    pub fn integer(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::Integer)
    }

    pub fn bigint(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::BigInt)
    }

    pub fn smallint(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::SmallInt)
    }

    pub fn boolean(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::Boolean)
    }

    pub fn float(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::Float)
    }

    pub fn decimal(&mut self, name: &str, precision: u32, scale: u32) -> &mut ColumnDefinition {
        self.column(name, ColumnType::Decimal { precision, scale })
    }

    pub fn datetime_with_timezone(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::DateTimeWithTimezone)
    }

    pub fn jsonb(&mut self, name: &str) -> &mut ColumnDefinition {
        self.column(name, ColumnType::JsonB)
    }

    /// Add `created_at` and `updated_at` with time zone, both `NOT NULL`
    pub fn timestamps_with_timezone(&mut self) -> &mut Self {
        self.datetime_with_timezone("created_at").not_null();
        self.datetime_with_timezone("updated_at").not_null();
        self
    }

    /// Add an indexed `<name>_id` integer column
    pub fn references(&mut self, name: &str) -> &mut ColumnDefinition {
        let column = format!("{}_id", name);
        self.indexes.push((vec![column.clone()], IndexOptions::default()));
        self.push(&column, ColumnKind::Typed(ColumnType::Integer))
    }

    /// Create an index after the table
    pub fn index(&mut self, columns: &[&str], options: IndexOptions) -> &mut Self {
        self.indexes
            .push((columns.iter().map(|c| c.to_string()).collect(), options));
        self
    }

    /// Add a unique constraint
    pub fn unique(&mut self, columns: &[&str]) -> &mut Self {
        self.constraints
            .push(TableConstraint::Unique(columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    /// Add a foreign key constraint
    pub fn foreign_key(
        &mut self,
        column: &str,
        references_table: &str,
        references_column: &str,
        on_delete: Option<OnDelete>,
    ) -> &mut Self {
        self.constraints.push(TableConstraint::ForeignKey {
            column: column.to_string(),
            table: references_table.to_string(),
            column_ref: references_column.to_string(),
            on_delete,
        });
        self
    }

    /// Build the CREATE TABLE statement followed by its indexes
    pub fn to_sql(&self, dialect: SqlDialect) -> Vec<String> {
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.to_sql(dialect)).collect();

        for constraint in &self.constraints {
            parts.push(match constraint {
                TableConstraint::Unique(columns) => format!(
                    "UNIQUE ({})",
                    columns
                        .iter()
                        .map(|c| dialect.quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                TableConstraint::ForeignKey {
                    column,
                    table,
                    column_ref,
                    on_delete,
                } => {
                    let mut sql = format!(
                        "FOREIGN KEY ({}) REFERENCES {} ({})",
                        dialect.quote_ident(column),
                        dialect.quote_ident(table),
                        dialect.quote_ident(column_ref)
                    );
                    if let Some(action) = on_delete {
                        sql.push(' ');
                        sql.push_str(action.to_sql());
                    }
                    sql
                }
            });
        }

        let mut statements = vec![format!(
            "CREATE TABLE {}{} (\n    {}\n)",
            if self.if_not_exists { "IF NOT EXISTS " } else { "" },
            dialect.quote_ident(&self.table_name),
            parts.join(",\n    ")
        )];

        for (columns, options) in &self.indexes {
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            statements.push(create_index_sql(dialect, &self.table_name, &columns, options, false));
        }

        statements
    }
}
