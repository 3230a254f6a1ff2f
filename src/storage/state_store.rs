//! Persistence of the session record.
//!
//! The record's existence is the "session is active" flag: each request may be
//! served by a fresh process, so nothing in memory is authoritative.

use crate::core::{Result, SessionError, SessionState};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Read/write/delete contract for the shared session record.
///
/// Implementations must make `write` atomic with respect to `read`, and
/// `delete` idempotent.
pub trait StateStore: Send + Sync {
    /// The stored record, or an empty one when there is no session.
    fn read(&self) -> Result<SessionState>;

    fn write(&self, state: &SessionState) -> Result<()>;

    fn exists(&self) -> bool;

    fn delete(&self) -> Result<()>;

    /// Human-readable location for diagnostics.
    fn location(&self) -> String;
}

/// JSON file replaced atomically on every write.
///
/// Writers serialize on an advisory `flock` held on a `<file>.lock` sidecar
/// and rename a fully written temp file over the record, so readers see
/// either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn lock(&self, exclusive: bool) -> Result<StateLock> {
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                SessionError::Io(format!(
                    "Failed to open lock file {}: {}",
                    lock_path.display(),
                    e
                ))
            })?;
        share_with_other_users(&lock_path);

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| {
            SessionError::Io(format!("Failed to lock state file {}: {}", self.path.display(), e))
        })?;
        Ok(StateLock(file))
    }
}

/// Held flock, released on drop.
struct StateLock(File);

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<SessionState> {
        if !self.path.exists() {
            return Ok(SessionState::new());
        }

        let _lock = self.lock(false)?;
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SessionState::new()),
            Err(e) => {
                return Err(SessionError::Io(format!(
                    "Failed to read state file {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        if contents.trim().is_empty() {
            return Ok(SessionState::new());
        }

        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            SessionError::Io(format!(
                "State file {} is not valid JSON: {}",
                self.path.display(),
                e
            ))
        })?;
        SessionState::from_value(value)
    }

    fn write(&self, state: &SessionState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| SessionError::Io(format!("Failed to serialize session state: {}", e)))?;

        let _lock = self.lock(true)?;
        let write_error = |e: std::io::Error| {
            SessionError::Io(format!("Failed to write state file {}: {}", self.path.display(), e))
        };

        let mut temp = NamedTempFile::new_in(self.directory()).map_err(write_error)?;
        temp.write_all(&content)
            .and_then(|_| temp.flush())
            .and_then(|_| temp.as_file().sync_data())
            .map_err(write_error)?;
        temp.persist(&self.path).map_err(|e| write_error(e.error))?;

        share_with_other_users(&self.path);
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(format!(
                "Unable to remove the test session state file, please remove it manually. File path: {} ({})",
                self.path.display(),
                e
            ))),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// The driver and the web server often run as different users.
#[cfg(unix)]
fn share_with_other_users(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o666));
}

#[cfg(not(unix))]
fn share_with_other_users(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("TESTS_RUNNING.json"));
        let record = SessionState::from_value(json!({
            "database": "ss_tmpdb1234567",
            "datetime": "2019-03-14 00:00:00",
            "mailer": "TestMailer",
            "fixtures": ["module/tests/Fixture.yml"],
            "extension": {"nested": true}
        }))
        .unwrap();

        store.write(&record).unwrap();
        assert!(store.exists());
        assert_eq!(store.read().unwrap(), record);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("absent.json"));
        assert!(!store.exists());
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_shorter_write_replaces_longer_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("state.json"));

        let long = SessionState::from_value(json!({"padding": "x".repeat(512)})).unwrap();
        store.write(&long).unwrap();
        let short = SessionState::from_value(json!({"a": 1})).unwrap();
        store.write(&short).unwrap();

        assert_eq!(store.read().unwrap(), short);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("state.json"));
        store.write(&SessionState::new()).unwrap();

        store.delete().unwrap();
        store.delete().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn test_write_to_unwritable_path_fails_with_io() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("missing-dir").join("state.json"));
        let err = store.write(&SessionState::new()).unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }

    #[test]
    fn test_write_replaces_file_without_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("TESTS_RUNNING.json"));
        store.write(&SessionState::from_value(json!({"a": 1})).unwrap()).unwrap();
        store.write(&SessionState::from_value(json!({"a": 2})).unwrap()).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["TESTS_RUNNING.json", "TESTS_RUNNING.json.lock"]);
        assert_eq!(store.read().unwrap().get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_readers_never_see_a_partial_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let long = SessionState::from_value(json!({"padding": "x".repeat(64 * 1024)})).unwrap();
        let short = SessionState::from_value(json!({"a": 1})).unwrap();
        FileStateStore::new(&path).write(&short).unwrap();

        let writer = {
            let store = FileStateStore::new(&path);
            let (long, short) = (long.clone(), short.clone());
            std::thread::spawn(move || {
                for i in 0..50 {
                    store.write(if i % 2 == 0 { &long } else { &short }).unwrap();
                }
            })
        };

        let store = FileStateStore::new(&path);
        for _ in 0..200 {
            let seen = store.read().unwrap();
            assert!(seen == long || seen == short);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_stale_lock_file_does_not_block_reads() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("state.json"));
        std::fs::write(store.lock_path(), "").unwrap();

        assert!(store.read().unwrap().is_empty());
        store.write(&SessionState::from_value(json!({"a": 1})).unwrap()).unwrap();
        assert_eq!(store.read().unwrap().get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileStateStore::new(&path).read().unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
