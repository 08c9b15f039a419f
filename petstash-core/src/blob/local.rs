/*!
Local filesystem blob store.
*/

use std::fs;
use std::path::{Path, PathBuf};

use super::{sanitize_relative_path, BlobStore};
use crate::{PetstashError, Result};

/// Blob store rooted at a directory on the local filesystem.
///
/// Every path handed to it is relative to the root and is checked with
/// [`sanitize_relative_path`] before touching the disk. Parent directories are
/// created on demand.
///
/// # Example
/// ```rust
/// use petstash_core::blob::{BlobStore, LocalBlobStore};
///
/// let dir = tempfile::tempdir()?;
/// let store = LocalBlobStore::with_base_dir(dir.path());
/// store.save(b"%PDF", "petstash-documents/invoice-12.pdf")?;
/// assert!(store.exists("petstash-documents/invoice-12.pdf"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    /// Create a blob store rooted at `base_dir`.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the full path for a relative blob path
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(sanitize_relative_path(path)?))
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    PetstashError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| {
            PetstashError::storage(format!("Failed to list {}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_files(&path, out)?;
            } else if path.is_file() {
                let relative = path.strip_prefix(&self.base_dir).map_err(|_| {
                    PetstashError::storage(format!(
                        "{} is outside {}",
                        path.display(),
                        self.base_dir.display()
                    ))
                })?;
                let relative: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(relative.join("/"));
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn save(&self, data: &[u8], path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        self.ensure_parent_dir(&full_path)?;

        fs::write(&full_path, data).map_err(|e| {
            PetstashError::storage(format!(
                "Failed to write {}: {}",
                full_path.display(),
                e
            ))
        })?;

        Ok(())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;

        fs::read(&full_path).map_err(|e| {
            PetstashError::storage(format!(
                "Failed to read {}: {}",
                full_path.display(),
                e
            ))
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path)
            .map(|full_path| full_path.exists())
            .unwrap_or(false)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        if full_path.exists() {
            fs::remove_file(&full_path).map_err(|e| {
                PetstashError::storage(format!(
                    "Failed to delete {}: {}",
                    full_path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full_path = self.resolve_path(dir)?;
        let mut files = Vec::new();
        if full_path.is_dir() {
            self.collect_files(&full_path, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    fn clear_dir(&self, dir: &str) -> Result<()> {
        let full_path = self.resolve_path(dir)?;
        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).map_err(|e| {
                PetstashError::storage(format!(
                    "Failed to clear {}: {}",
                    full_path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_blob_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::with_base_dir(temp_dir.path());

        let data = b"photo bytes";
        let path = "2024/03/rex.jpg";

        assert!(store.save(data, path).is_ok());
        assert!(store.exists(path));
        assert_eq!(store.load(path).unwrap(), data);

        assert!(store.delete(path).is_ok());
        assert!(!store.exists(path));
    }

    #[test]
    fn test_list_and_clear_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::with_base_dir(temp_dir.path());

        store.save(b"a", "petstash-documents/a.html").unwrap();
        store.save(b"b", "petstash-documents/2024/b.html").unwrap();
        store.save(b"c", "other/c.txt").unwrap();

        assert_eq!(
            store.list("petstash-documents").unwrap(),
            vec![
                "petstash-documents/2024/b.html".to_string(),
                "petstash-documents/a.html".to_string()
            ]
        );

        store.clear_dir("petstash-documents").unwrap();
        assert!(store.list("petstash-documents").unwrap().is_empty());
        assert!(store.exists("other/c.txt"));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::with_base_dir(temp_dir.path());

        assert!(store.save(b"x", "../outside.txt").is_err());
        assert!(store.save(b"x", "/etc/passwd").is_err());
        assert!(!store.exists("../outside.txt"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::with_base_dir(temp_dir.path());

        assert!(store.load("missing.png").is_err());
    }
}
