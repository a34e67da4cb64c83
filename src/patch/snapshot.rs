//! Pre-patch backup of the source tree.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::fsutil::{copy_dir_recursive, move_dir};

/// Full copy of the source tree taken before patching starts.
///
/// [`restore`](Self::restore) puts the copy back; [`discard`](Self::discard)
/// deletes it once the run has succeeded.
#[derive(Debug)]
pub struct BackupSnapshot {
    source: PathBuf,
    backup: PathBuf,
}

impl BackupSnapshot {
    pub fn create(source: &Path, backup: &Path) -> Result<Self> {
        if backup.exists() {
            debug!("removing stale backup {}", backup.display());
            fs::remove_dir_all(backup)
                .with_context(|| format!("removing stale backup '{}'", backup.display()))?;
        }
        info!("backing up {} -> {}", source.display(), backup.display());
        copy_dir_recursive(source, backup)
            .with_context(|| format!("backing up source tree '{}'", source.display()))?;
        Ok(Self {
            source: source.to_path_buf(),
            backup: backup.to_path_buf(),
        })
    }

    /// Replace the source tree with the backup.
    pub fn restore(self) -> Result<()> {
        info!("restoring {} from backup", self.source.display());
        if self.source.exists() {
            fs::remove_dir_all(&self.source).with_context(|| {
                format!("removing patched source tree '{}'", self.source.display())
            })?;
        }
        move_dir(&self.backup, &self.source).with_context(|| {
            format!(
                "restoring '{}' from backup '{}'",
                self.source.display(),
                self.backup.display()
            )
        })
    }

    pub fn discard(self) -> Result<()> {
        debug!("removing backup {}", self.backup.display());
        fs::remove_dir_all(&self.backup)
            .with_context(|| format!("removing backup '{}'", self.backup.display()))
    }
}
