//! Named databases backed by SQLite files in one data directory.
//!
//! Every process that knows the data directory sees the same set of
//! databases, which is what lets the driver and the web server share one.

use crate::core::{Result, SessionError};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATABASE_EXTENSION: &str = "sqlite";

#[derive(Debug, Clone)]
pub struct SqliteServer {
    data_dir: PathBuf,
    busy_timeout: Duration,
}

impl SqliteServer {
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", name, DATABASE_EXTENSION))
    }

    pub fn database_exists(&self, name: &str) -> bool {
        is_plain_name(name) && self.database_path(name).is_file()
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        ensure_plain_name(name).map_err(SessionError::Provisioning)?;
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            SessionError::Provisioning(format!(
                "Failed to create data directory {}: {}",
                self.data_dir.display(),
                e
            ))
        })?;

        let path = self.database_path(name);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SessionError::Provisioning(format!("Failed to create database '{}': {}", name, e)))?;

        // SQLite creates the file lazily; force it onto disk.
        conn.execute_batch("PRAGMA user_version = 1;")
            .map_err(|e| SessionError::Provisioning(format!("Failed to initialize database '{}': {}", name, e)))?;
        Ok(())
    }

    /// Opens an existing database. Never creates one.
    pub fn open(&self, name: &str) -> Result<Connection> {
        ensure_plain_name(name).map_err(SessionError::Connection)?;
        let path = self.database_path(name);
        if !path.is_file() {
            return Err(SessionError::Connection(format!(
                "Database '{}' does not exist",
                name
            )));
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SessionError::Connection(format!("Failed to connect to '{}': {}", name, e)))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| SessionError::Connection(format!("Failed to configure '{}': {}", name, e)))?;
        Ok(conn)
    }

    /// Removes the database files. Returns `false` if it was already gone.
    pub fn drop_database(&self, name: &str) -> Result<bool> {
        ensure_plain_name(name).map_err(SessionError::Provisioning)?;
        let path = self.database_path(name);
        let existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                return Err(SessionError::Provisioning(format!(
                    "Failed to drop database '{}': {}",
                    name, e
                )));
            }
        };

        for suffix in ["-journal", "-wal", "-shm"] {
            let mut side = path.clone().into_os_string();
            side.push(suffix);
            let _ = fs::remove_file(PathBuf::from(side));
        }
        Ok(existed)
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Connection(format!(
                    "Failed to list databases in {}: {}",
                    self.data_dir.display(),
                    e
                )));
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|ext| ext.to_str()) == Some(DATABASE_EXTENSION)
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ensure_plain_name(name: &str) -> std::result::Result<(), String> {
    if is_plain_name(name) {
        Ok(())
    } else {
        Err(format!("Invalid database name '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(temp: &TempDir) -> SqliteServer {
        SqliteServer::new(temp.path().join("databases"), Duration::from_secs(1))
    }

    #[test]
    fn test_create_open_drop() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);

        assert!(!server.database_exists("app"));
        server.create_database("app").unwrap();
        assert!(server.database_exists("app"));

        let conn = server.open("app").unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        drop(conn);

        assert!(server.drop_database("app").unwrap());
        assert!(!server.drop_database("app").unwrap());
        assert!(!server.database_exists("app"));
    }

    #[test]
    fn test_open_never_creates() {
        let temp = TempDir::new().unwrap();
        let err = server(&temp).open("ghost").unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert!(!server(&temp).database_exists("ghost"));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);
        assert!(server.create_database("../escape").is_err());
        assert!(!server.database_exists("../escape"));
    }

    #[test]
    fn test_list_databases_sorted() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp);
        assert!(server.list_databases().unwrap().is_empty());

        server.create_database("b").unwrap();
        server.create_database("a").unwrap();
        assert_eq!(server.list_databases().unwrap(), vec!["a", "b"]);
    }
}
