//! Loading structured fixture files into the active database.
//!
//! The YAML layout is `Table: { identifier: { Column: value } }`. Tables and
//! columns are created on demand, so a fixture can seed an empty database.

use crate::core::{Result, SessionError};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::HashSet;
use std::path::Path;

pub trait FixtureLoader: Send + Sync {
    /// Loads `path` into `conn`, returning the number of records written.
    fn load(&self, conn: &Connection, path: &Path) -> Result<usize>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlFixtureLoader;

impl FixtureLoader for YamlFixtureLoader {
    fn load(&self, conn: &Connection, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Io(format!("Failed to read fixture {}: {}", path.display(), e))
        })?;
        let document: YamlValue = serde_yaml::from_str(&text).map_err(|e| {
            SessionError::Io(format!("Fixture {} is not valid YAML: {}", path.display(), e))
        })?;

        let tables = match document {
            YamlValue::Mapping(tables) => tables,
            YamlValue::Null => return Ok(0),
            _ => {
                return Err(SessionError::Io(format!(
                    "Fixture {} must map table names to records",
                    path.display()
                )));
            }
        };

        let mut written = 0;
        for (table, records) in &tables {
            let table = identifier(table, path)?;
            let Some(records) = records.as_mapping() else {
                continue;
            };
            ensure_table(conn, &table)?;
            for (record_id, fields) in records {
                let record_id = scalar_text(record_id).unwrap_or_default();
                let fields = fields.as_mapping().cloned().unwrap_or_else(Mapping::new);
                insert_record(conn, &table, &record_id, &fields, path)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

fn identifier(value: &YamlValue, path: &Path) -> Result<String> {
    let name = scalar_text(value).unwrap_or_default();
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(SessionError::Io(format!(
            "Fixture {} uses invalid identifier '{}'",
            path.display(),
            name
        )))
    }
}

fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\"ID\" INTEGER PRIMARY KEY AUTOINCREMENT, \"FixtureIdentifier\" TEXT)",
        table
    ))
    .map_err(|e| SessionError::Io(format!("Failed to create fixture table {}: {}", table, e)))
}

fn existing_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table))
        .map_err(|e| SessionError::Io(format!("Failed to inspect {}: {}", table, e)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| SessionError::Io(format!("Failed to inspect {}: {}", table, e)))?
        .filter_map(|column| column.ok())
        .collect();
    Ok(columns)
}

fn insert_record(
    conn: &Connection,
    table: &str,
    record_id: &str,
    fields: &Mapping,
    path: &Path,
) -> Result<()> {
    let mut known = existing_columns(conn, table)?;
    let mut columns = vec!["FixtureIdentifier".to_string()];
    let mut values = vec![SqlValue::Text(record_id.to_string())];

    for (column, value) in fields {
        let column = identifier(column, path)?;
        if !known.contains(&column) {
            conn.execute_batch(&format!("ALTER TABLE \"{}\" ADD COLUMN \"{}\"", table, column))
                .map_err(|e| SessionError::Io(format!("Failed to add column {}.{}: {}", table, column, e)))?;
            known.insert(column.clone());
        }
        columns.push(column);
        values.push(to_sql(value));
    }

    let column_list = columns
        .iter()
        .map(|column| format!("\"{}\"", column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    conn.execute(
        &format!("INSERT INTO \"{}\" ({}) VALUES ({})", table, column_list, placeholders),
        params_from_iter(values),
    )
    .map_err(|e| SessionError::Io(format!("Failed to insert fixture {}.{}: {}", table, record_id, e)))?;
    Ok(())
}

fn scalar_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_sql(value: &YamlValue) -> SqlValue {
    match value {
        YamlValue::Null => SqlValue::Null,
        YamlValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        YamlValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            _ => SqlValue::Text(n.to_string()),
        },
        YamlValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other).unwrap_or_default()),
    }
}
