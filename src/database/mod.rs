//! Ephemeral, per-session databases.
//!
//! A session owns one database whose name carries the `<prefix>tmpdb` marker.
//! Clients may only ever point a session at names carrying that marker, which
//! keeps them away from the application's real databases.

pub mod dump;
pub mod server;

pub use server::SqliteServer;

use crate::config::TestSessionConfig;
use crate::core::{Result, SessionError};
use crate::host::SchemaBuilder;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Attempts at finding an unused random name before giving up.
const NAME_ATTEMPTS: usize = 16;

struct ActiveConnection {
    name: String,
    conn: Connection,
}

pub struct EphemeralDatabase {
    server: SqliteServer,
    prefix: String,
    default_database: Option<String>,
    /// The process's selected database
    active: Mutex<Option<ActiveConnection>>,
    /// Database selected before the session switched away from it
    previous: Mutex<Option<String>>,
}

impl EphemeralDatabase {
    pub fn new(server: SqliteServer, prefix: &str, default_database: Option<String>) -> Self {
        Self {
            server,
            prefix: prefix.to_lowercase(),
            default_database,
            active: Mutex::new(None),
            previous: Mutex::new(None),
        }
    }

    pub fn from_config(config: &TestSessionConfig) -> Self {
        Self::new(
            SqliteServer::new(&config.data_dir, config.busy_timeout),
            &config.database_prefix,
            config.default_database.clone(),
        )
    }

    pub fn server(&self) -> &SqliteServer {
        &self.server
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `true` for names following the `<prefix>tmpdb...` convention
    /// (case-insensitive, non-empty `[a-z0-9_]` suffix).
    pub fn is_temp_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        match name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix("tmpdb"))
        {
            Some(suffix) => {
                !suffix.is_empty()
                    && suffix
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            }
            None => false,
        }
    }

    pub fn validate_name(&self, name: &str) -> Result<()> {
        if self.is_temp_name(name) {
            Ok(())
        } else {
            Err(SessionError::InvalidArgument(format!(
                "Invalid database name format '{}', expected {}tmpdb<suffix>",
                name, self.prefix
            )))
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.server.database_exists(name)
    }

    /// Creates a database under a fresh random name and returns that name.
    pub fn create(&self) -> Result<String> {
        for _ in 0..NAME_ATTEMPTS {
            let name = self.random_name();
            if self.exists(&name) {
                continue;
            }
            self.server.create_database(&name)?;
            info!(database = %name, "created temp database");
            return Ok(name);
        }
        Err(SessionError::Provisioning(format!(
            "Could not find an unused temp database name after {} attempts",
            NAME_ATTEMPTS
        )))
    }

    /// Creates a database under a caller-chosen name.
    pub fn create_named(&self, name: &str) -> Result<()> {
        self.validate_name(name)?;
        if self.exists(name) {
            return Err(SessionError::Provisioning(format!(
                "Database '{}' already exists",
                name
            )));
        }
        self.server.create_database(name)?;
        info!(database = %name, "created temp database");
        Ok(())
    }

    /// Selects `name` as the process's database.
    ///
    /// The open connection is kept when it already points at `name`.
    pub fn connect(&self, name: &str) -> Result<()> {
        let mut active = self.active.lock()?;
        if let Some(current) = active.as_ref() {
            if current.name == name {
                return Ok(());
            }
        }

        let conn = self.server.open(name)?;
        let replaced = active.replace(ActiveConnection {
            name: name.to_string(),
            conn,
        });
        if let Some(old) = replaced {
            debug!(from = %old.name, to = %name, "switched database");
            // Keep the application's database, not another session's.
            if !self.is_temp_name(&old.name) {
                *self.previous.lock()? = Some(old.name);
            }
        } else {
            debug!(to = %name, "connected to database");
        }
        Ok(())
    }

    pub fn selected_database(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|a| a.name.clone()))
    }

    /// Whether the process currently works against an ephemeral database.
    pub fn is_used(&self) -> bool {
        self.selected_database()
            .map(|name| self.is_temp_name(&name))
            .unwrap_or(false)
    }

    /// Destroys `name`. Returns `false` when it was already gone.
    pub fn drop_database(&self, name: &str) -> Result<bool> {
        {
            let mut active = self.active.lock()?;
            if active.as_ref().map(|a| a.name == name).unwrap_or(false) {
                active.take();
            }
        }

        let existed = self.server.drop_database(name)?;
        if existed {
            info!(database = %name, "deleted temp database");
        } else {
            warn!(database = %name, "temp database already gone");
        }
        Ok(existed)
    }

    /// Re-selects the database that was in use before the session.
    pub fn restore_default(&self) -> Result<()> {
        let previous = self.previous.lock()?.take();
        let target = previous
            .filter(|name| !self.is_temp_name(name))
            .or_else(|| self.default_database.clone());

        match target {
            Some(name) if self.exists(&name) => self.connect(&name),
            _ => {
                self.active.lock()?.take();
                Ok(())
            }
        }
    }

    /// Runs `f` against the selected database.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let active = self.active.lock()?;
        match active.as_ref() {
            Some(current) => f(&current.conn),
            None => Err(SessionError::Connection(
                "No database selected".to_string(),
            )),
        }
    }

    /// Runs `f` on a connection of its own to `name`, leaving the selected
    /// database alone.
    ///
    /// Session-scoped work goes through here so that another session switching
    /// the process's selection cannot redirect it.
    pub fn with_database<T>(&self, name: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.server.open(name)?;
        f(&conn)
    }

    /// Imports a SQL dump into `name`, then reconciles the schema (the dump
    /// may have created tables of its own).
    pub fn import_dump(
        &self,
        name: &str,
        path: &Path,
        schema: &dyn SchemaBuilder,
        require_default_records: bool,
    ) -> Result<usize> {
        let sql = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Io(format!("Failed to read database dump {}: {}", path.display(), e))
        })?;
        let statements = dump::split_statements(&sql);

        self.with_database(name, |conn| {
            let count = dump::run_statements(conn, &statements)?;
            schema.build(conn, require_default_records)?;
            Ok(count)
        })
        .inspect(|count| info!(dump = %path.display(), database = %name, statements = count, "imported database dump"))
    }

    pub fn require_default_records(&self, name: &str, schema: &dyn SchemaBuilder) -> Result<()> {
        self.with_database(name, |conn| schema.build(conn, true))
    }

    /// Runs a setup script against `name`.
    pub fn run_script(&self, name: &str, path: &Path) -> Result<usize> {
        self.with_database(name, |conn| dump::run_script(conn, path))
    }

    /// Deletes every row of every table of `name` except `keep`. Returns the
    /// number of tables emptied.
    pub fn clear_all_data(&self, name: &str, keep: &[&str]) -> Result<usize> {
        self.with_database(name, |conn| {
            let tables = list_tables(conn)?;
            let mut cleared = 0;
            for table in tables.iter().filter(|t| !keep.contains(&t.as_str())) {
                conn.execute_batch(&format!("DELETE FROM \"{}\"", table.replace('"', "\"\"")))
                    .map_err(|e| {
                        SessionError::Connection(format!("Failed to clear table {}: {}", table, e))
                    })?;
                cleared += 1;
            }
            Ok(cleared)
        })
    }

    /// Finds leftover temp databases and, unless `dry_run`, drops them.
    pub fn purge_temp_databases(&self, dry_run: bool) -> Result<Vec<String>> {
        let marker = format!("{}tmpdb", self.prefix);
        let found: Vec<String> = self
            .server
            .list_databases()?
            .into_iter()
            .filter(|name| name.to_lowercase().starts_with(&marker))
            .collect();

        if !dry_run {
            for name in &found {
                self.drop_database(name)?;
            }
        }
        Ok(found)
    }

    fn random_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().as_u128() % 10_000_000;
        format!("{}tmpdb{:07}", self.prefix, suffix)
    }
}

fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .map_err(|e| SessionError::Connection(format!("Failed to list tables: {}", e)))?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| SessionError::Connection(format!("Failed to list tables: {}", e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SessionError::Connection(format!("Failed to list tables: {}", e)))?;
    Ok(tables)
}
