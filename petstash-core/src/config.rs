//! Configuration for the database, the upload area and the backup directory
//!
//! Values come from code (`default_local`), from `PETSTASH_*` environment
//! variables, or from the CLI flags that override them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::archive::SnapshotArchive;
use crate::blob::LocalBlobStore;
use crate::compression::{CompressionAdapter, GzipCompressor, NoCompression};
use crate::store::SqliteStore;
use crate::{PetstashError, Result};

pub const ENV_DATABASE: &str = "PETSTASH_DATABASE";
pub const ENV_UPLOADS: &str = "PETSTASH_UPLOADS";
pub const ENV_TABLE_PREFIX: &str = "PETSTASH_TABLE_PREFIX";
pub const ENV_BACKUP_DIR: &str = "PETSTASH_BACKUP_DIR";
pub const ENV_COMPRESSION: &str = "PETSTASH_COMPRESSION";

/// Archive compression setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Gzip,
    None,
}

impl CompressionKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" | "true" | "1" => Some(Self::Gzip),
            "none" | "off" | "false" | "0" => Some(Self::None),
            _ => None,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetstashConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Root of the shared upload area
    pub upload_root: PathBuf,
    /// Installation table prefix, e.g. `wp_`
    pub table_prefix: String,
    /// Where backup archives are written
    pub backup_dir: PathBuf,
    pub compression: CompressionKind,
}

impl PetstashConfig {
    /// Defaults for a single local installation under `./petstash-data`
    pub fn default_local() -> Self {
        PetstashConfig {
            database_path: PathBuf::from("petstash-data/petstash.db"),
            upload_root: PathBuf::from("petstash-data/uploads"),
            table_prefix: "wp_".to_string(),
            backup_dir: PathBuf::from("petstash-data/backups"),
            compression: CompressionKind::Gzip,
        }
    }

    /// Local defaults overridden by `PETSTASH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default_local();

        if let Some(path) = lookup(ENV_DATABASE) {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_UPLOADS) {
            config.upload_root = PathBuf::from(path);
        }
        if let Some(prefix) = lookup(ENV_TABLE_PREFIX) {
            config.table_prefix = prefix;
        }
        if let Some(path) = lookup(ENV_BACKUP_DIR) {
            config.backup_dir = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_COMPRESSION) {
            config.compression = CompressionKind::parse(&value).ok_or_else(|| {
                PetstashError::config(format!("{ENV_COMPRESSION} must be 'gzip' or 'none', got '{value}'"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(PetstashError::config("database path cannot be empty"));
        }
        if self.upload_root.as_os_str().is_empty() {
            return Err(PetstashError::config("upload root cannot be empty"));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(PetstashError::config("backup directory cannot be empty"));
        }
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PetstashError::config(format!(
                "table prefix '{}' may only contain letters, digits and underscores",
                self.table_prefix
            )));
        }
        Ok(())
    }

    pub fn compressor(&self) -> Box<dyn CompressionAdapter> {
        match self.compression {
            CompressionKind::Gzip => Box::new(GzipCompressor::new()),
            CompressionKind::None => Box::new(NoCompression::new()),
        }
    }

    pub fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.database_path, &self.table_prefix)
    }

    pub fn uploads(&self) -> LocalBlobStore {
        LocalBlobStore::with_base_dir(&self.upload_root)
    }

    pub fn archive(&self) -> SnapshotArchive<LocalBlobStore, Box<dyn CompressionAdapter>> {
        SnapshotArchive::new(LocalBlobStore::with_base_dir(&self.backup_dir), self.compressor())
    }
}

impl Default for PetstashConfig {
    fn default() -> Self {
        Self::default_local()
    }
}
