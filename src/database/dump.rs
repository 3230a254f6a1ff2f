//! Plain-text SQL dumps.

use crate::core::{Result, SessionError};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;
use std::path::Path;

lazy_static! {
    /// Whole-line comments: `-- ...`, `# ...` and `/* ... */` directives.
    static ref COMMENT_LINE: Regex = Regex::new(r"(?m)^[ \t]*(--|#|/).*$\n?").unwrap();
    static ref BLANK_LINE: Regex = Regex::new(r"(?m)^[ \t]*$\n").unwrap();
    static ref TERMINATOR: Regex = Regex::new(r";[ \t]*\r?\n").unwrap();
}

/// Splits a dump into statements, dropping comment and blank lines.
pub fn split_statements(sql: &str) -> Vec<String> {
    let stripped = COMMENT_LINE.replace_all(sql, "");
    let stripped = BLANK_LINE.replace_all(&stripped, "");

    TERMINATOR
        .split(&stripped)
        .map(|statement| statement.trim().trim_end_matches(';').trim())
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

/// Executes every statement of `path` in order.
///
/// Stops at the first failure, naming the failing statement.
pub fn run_script(conn: &Connection, path: &Path) -> Result<usize> {
    let sql = std::fs::read_to_string(path).map_err(|e| {
        SessionError::Io(format!("Failed to read SQL file {}: {}", path.display(), e))
    })?;
    run_statements(conn, &split_statements(&sql))
}

pub fn run_statements(conn: &Connection, statements: &[String]) -> Result<usize> {
    for statement in statements {
        conn.execute_batch(statement)
            .map_err(|e| SessionError::Import {
                statement: statement.clone(),
                message: e.to_string(),
            })?;
    }
    Ok(statements.len())
}
