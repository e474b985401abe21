use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Advisory lock file guarding one-at-a-time maintenance on a database
/// (consolidation). Unlocked when dropped.
#[derive(Debug)]
pub struct MaintenanceLock {
    file: File,
    path: PathBuf,
}

impl MaintenanceLock {
    /// Lock `<db>.lock` next to the database, failing fast with
    /// [`StoreError::Locked`] when another process holds it.
    pub fn for_database(db_path: &Path) -> Result<Self> {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        Self::acquire(Path::new(&name))
    }

    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.display().to_string()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly (normally handled by Drop).
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}
