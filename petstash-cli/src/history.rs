//! Backup ledger kept next to the archives as JSON lines.

use petstash_core::{BackupHistory, BackupRecord, BackupStats, PetstashError};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const HISTORY_FILE_NAME: &str = "history.jsonl";

pub struct FileHistory {
    backup_dir: PathBuf,
}

impl FileHistory {
    pub fn new<P: AsRef<Path>>(backup_dir: P) -> Self {
        Self {
            backup_dir: backup_dir.as_ref().to_path_buf(),
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.backup_dir.join(HISTORY_FILE_NAME)
    }

    /// Every readable ledger entry, oldest first.
    pub fn records(&self) -> petstash_core::Result<Vec<BackupRecord>> {
        let path = self.ledger_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BackupRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping line {} of {}: {}", number + 1, path.display(), e),
            }
        }
        Ok(records)
    }

    pub fn find(&self, filename: &str) -> petstash_core::Result<Option<BackupRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .find(|record| record.filename == filename))
    }
}

impl BackupHistory for FileHistory {
    fn record_backup(
        &self,
        filename: &str,
        size_bytes: u64,
        stats: &BackupStats,
    ) -> petstash_core::Result<()> {
        fs::create_dir_all(&self.backup_dir)?;
        let record = BackupRecord {
            filename: filename.to_string(),
            size_bytes,
            stats: stats.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    fn fetch_stored_snapshot_bytes(&self, id: &str) -> petstash_core::Result<Vec<u8>> {
        let record = self
            .find(id)?
            .ok_or_else(|| PetstashError::storage(format!("No backup named '{id}' in history")))?;
        Ok(fs::read(self.backup_dir.join(record.filename))?)
    }
}
