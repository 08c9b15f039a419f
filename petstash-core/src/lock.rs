/*!
Exclusive restore lock.
*/

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{PetstashError, Result};

/// Lock file name, created inside the upload root.
pub const LOCK_FILE_NAME: &str = ".petstash-restore.lock";

/// Proof that the caller holds the restore lock.
///
/// Acquired by creating the lock file exclusively; released when dropped.
/// [`RestoreEngine::restore`](crate::RestoreEngine::restore) requires one.
#[derive(Debug)]
pub struct RestoreLock {
    path: PathBuf,
}

impl RestoreLock {
    /// Take the lock for `upload_root`, failing if another restore holds it.
    pub fn acquire<P: AsRef<Path>>(upload_root: P) -> Result<Self> {
        let root = upload_root.as_ref();
        fs::create_dir_all(root).map_err(|e| {
            PetstashError::storage(format!("Failed to create {}: {}", root.display(), e))
        })?;

        let path = root.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PetstashError::storage(format!(
                    "Another restore is in progress (lock file {} exists)",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired restore lock {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release restore lock {}: {}", self.path.display(), e);
        }
    }
}
