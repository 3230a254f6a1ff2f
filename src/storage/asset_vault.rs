//! Moves the watched asset tree aside for the duration of a session.
//!
//! Everything is a `rename`: no file is ever copied or deleted, only empty
//! directories are removed.

use crate::core::{Result, SessionError};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AssetVault {
    root: PathBuf,
    backup_root: PathBuf,
    ignore: HashSet<String>,
}

/// Counts reported by a backup or restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub files_moved: usize,
    pub dirs_removed: usize,
}

impl AssetVault {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(root: P, backup_root: Q, ignore: &[String]) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            backup_root: backup_root.as_ref().to_path_buf(),
            ignore: ignore.iter().cloned().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn has_backup(&self) -> bool {
        self.backup_root.is_dir()
    }

    /// Parks the watched tree in the backup root.
    ///
    /// Returns `None` when a backup already exists: the parked files are the
    /// genuine pre-session state and must not be mixed with session output.
    pub fn backup(&self) -> Result<Option<MoveReport>> {
        if self.has_backup() {
            warn!(backup = %self.backup_root.display(), "asset backup already present, skipping");
            return Ok(None);
        }
        if !self.root.is_dir() {
            return Ok(Some(MoveReport::default()));
        }

        fs::create_dir_all(&self.backup_root).map_err(|e| {
            SessionError::Io(format!(
                "Failed to create asset backup folder {}: {}",
                self.backup_root.display(),
                e
            ))
        })?;

        let mut report = MoveReport::default();
        move_recursive(&self.root, &self.backup_root, &self.ignore, &mut report)?;
        info!(
            from = %self.root.display(),
            to = %self.backup_root.display(),
            files = report.files_moved,
            "assets backed up"
        );
        Ok(Some(report))
    }

    /// Moves the backup back into place and removes the backup root.
    ///
    /// A missing backup root means there is nothing to restore (already
    /// restored, or never backed up), which is not an error.
    pub fn restore(&self) -> Result<Option<MoveReport>> {
        if !self.has_backup() {
            return Ok(None);
        }

        fs::create_dir_all(&self.root).map_err(|e| {
            SessionError::Io(format!(
                "Failed to create asset folder {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut report = MoveReport::default();
        move_recursive(&self.backup_root, &self.root, &HashSet::new(), &mut report)?;

        match fs::remove_dir(&self.backup_root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                backup = %self.backup_root.display(),
                error = %e,
                "asset backup folder not empty after restore, leaving it in place"
            ),
        }

        info!(
            from = %self.backup_root.display(),
            to = %self.root.display(),
            files = report.files_moved,
            "assets restored"
        );
        Ok(Some(report))
    }
}

fn move_recursive(
    src: &Path,
    dest: &Path,
    ignore: &HashSet<String>,
    report: &mut MoveReport,
) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    if !dest.is_dir() {
        fs::create_dir(dest).map_err(|e| {
            SessionError::Io(format!("Failed to create folder {}: {}", dest.display(), e))
        })?;
    }

    let entries = fs::read_dir(src).map_err(|e| {
        SessionError::Io(format!("Failed to read folder {}: {}", src.display(), e))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            SessionError::Io(format!("Failed to read entry in {}: {}", src.display(), e))
        })?;
        let name = entry.file_name();
        let ignored = ignore.contains(name.to_string_lossy().as_ref());
        let file_type = entry.file_type().map_err(|e| {
            SessionError::Io(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;
        let target = dest.join(&name);

        if file_type.is_dir() {
            // Ignored directories keep themselves but still hand over their children.
            move_recursive(&entry.path(), &target, ignore, report)?;
            if !ignored && remove_if_empty(&entry.path())? {
                report.dirs_removed += 1;
            }
        } else if !ignored {
            fs::rename(entry.path(), &target).map_err(|e| {
                SessionError::Io(format!(
                    "Failed to move {} to {}: {}",
                    entry.path().display(),
                    target.display(),
                    e
                ))
            })?;
            report.files_moved += 1;
        }
    }

    Ok(())
}

/// Removes `dir` only if nothing is left in it, e.g. an ignored file.
fn remove_if_empty(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| SessionError::Io(format!("Failed to read folder {}: {}", dir.display(), e)))?;
    if entries.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir)
        .map_err(|e| SessionError::Io(format!("Failed to remove folder {}: {}", dir.display(), e)))?;
    Ok(true)
}
