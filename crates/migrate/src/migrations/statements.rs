//! SQL statement splitting for file-based migrations

use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::backends::SqlDialect;

/// Split a script into individual statements.
///
/// Uses the sqlparser tokenizer so semicolons inside string literals,
/// dollar-quoted bodies and comments do not end a statement. Fragments made
/// only of comments and whitespace are dropped. Returned statements carry no
/// trailing semicolon.
pub fn split_sql_statements(sql: &str, dialect: SqlDialect) -> Vec<String> {
    let parser_dialect: Box<dyn Dialect> = match dialect {
        SqlDialect::PostgreSQL => Box::new(PostgreSqlDialect {}),
        SqlDialect::SQLite => Box::new(SQLiteDialect {}),
    };

    let tokens = match Tokenizer::new(parser_dialect.as_ref(), sql)
        .with_unescape(false)
        .tokenize()
    {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!(error = %e, "SQL tokenizing failed, using naive semicolon splitting");
            return naive_split(sql);
        }
    };

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;

    for token in tokens {
        match token {
            Token::SemiColon => {
                push_statement(&mut statements, &mut current, has_code);
                has_code = false;
            }
            Token::EOF => {}
            Token::Whitespace(ws) => {
                current.push_str(&ws.to_string());
                if let Whitespace::SingleLineComment { .. } = ws {
                    // the comment token owns its newline, keep following tokens apart
                    if !current.ends_with('\n') {
                        current.push('\n');
                    }
                }
            }
            other => {
                has_code = true;
                current.push_str(&other.to_string());
            }
        }
    }
    push_statement(&mut statements, &mut current, has_code);

    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String, has_code: bool) {
    let statement = current.trim().to_string();
    current.clear();
    if has_code && !statement.is_empty() {
        statements.push(statement);
    }
}

fn naive_split(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !is_comment_only(s))
        .map(str::to_string)
        .collect()
}

fn is_comment_only(fragment: &str) -> bool {
    fragment
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}
