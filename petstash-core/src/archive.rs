/*!
Backup archives and the backup service facade.

[`SnapshotArchive`] persists built snapshots as (optionally gzipped) JSON
files with a SHA-256 checksum. [`BackupService`] wires the builder, the
archive, the validator and the restore engine to the external history
ledger.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::compression::{decompress_if_gzip, CompressionAdapter};
use crate::exporter::{BuildRequest, BuiltSnapshot, SnapshotBuilder};
use crate::lock::RestoreLock;
use crate::model::{BackupStats, Snapshot};
use crate::restore::{RestoreEngine, RestoreReport};
use crate::store::EntityStore;
use crate::validator::SnapshotValidator;
use crate::{PetstashError, Result};

/// File name prefix of generated archives.
pub const ARCHIVE_PREFIX: &str = "petstash-backup-";

/// A stored archive, as handed to the history ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub stats: BackupStats,
}

/// Ledger of past backups. Implemented outside this crate.
pub trait BackupHistory {
    fn record_backup(&self, filename: &str, size_bytes: u64, stats: &BackupStats) -> Result<()>;

    /// Raw archive bytes of a previously recorded backup.
    fn fetch_stored_snapshot_bytes(&self, id: &str) -> Result<Vec<u8>>;
}

/// SHA-256 of `data` as lowercase hex.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// `petstash-backup-YYYYmmdd-HHMMSS-<8 hex>.json[.gz]`
pub fn archive_file_name(generated_at: DateTime<Utc>, extension: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{ARCHIVE_PREFIX}{}-{}.json{}",
        generated_at.format("%Y%m%d-%H%M%S"),
        &suffix[..8],
        extension
    )
}

/// Gunzip when needed, then validate.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let json = decompress_if_gzip(bytes)?;
    Ok(SnapshotValidator::new().validate_bytes(&json)?)
}

/// Writes and reads backup archives in a blob store.
pub struct SnapshotArchive<B: BlobStore, C: CompressionAdapter> {
    blobs: B,
    compressor: C,
}

impl<B: BlobStore, C: CompressionAdapter> SnapshotArchive<B, C> {
    pub fn new(blobs: B, compressor: C) -> Self {
        Self { blobs, compressor }
    }

    /// Serialize, compress and store a built snapshot.
    pub fn write(&self, built: &BuiltSnapshot) -> Result<BackupRecord> {
        let json = serde_json::to_vec(&built.snapshot)?;
        let data = self.compressor.compress(&json)?;
        let filename =
            archive_file_name(built.snapshot.generated_at, self.compressor.file_extension());

        self.blobs.save(&data, &filename)?;

        let mut stats = built.stats.clone();
        stats.checksum = Some(compute_checksum(&data));

        #[cfg(feature = "metrics")]
        crate::observability::PetstashMetrics::global().record_backup(data.len());

        info!(
            "Wrote backup {} ({} bytes, {})",
            filename,
            data.len(),
            self.compressor.algorithm_name()
        );
        Ok(BackupRecord {
            filename,
            size_bytes: data.len() as u64,
            stats,
        })
    }

    /// Raw bytes of a stored archive.
    pub fn read_raw(&self, filename: &str) -> Result<Vec<u8>> {
        self.blobs.load(filename)
    }

    /// Decompressed JSON bytes of a stored archive.
    pub fn read(&self, filename: &str) -> Result<Vec<u8>> {
        decompress_if_gzip(&self.read_raw(filename)?)
    }

    /// Compare a stored archive with the checksum recorded for it.
    pub fn verify(&self, filename: &str, expected: &str) -> Result<()> {
        let actual = compute_checksum(&self.read_raw(filename)?);
        if actual == expected {
            Ok(())
        } else {
            Err(PetstashError::IntegrityCheckFailed {
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// Backup and restore entry points used by the CLI and the scheduler.
pub struct BackupService<'a, S, U, A, C, H>
where
    S: EntityStore + ?Sized,
    U: BlobStore + ?Sized,
    A: BlobStore,
    C: CompressionAdapter,
    H: BackupHistory + ?Sized,
{
    store: &'a S,
    uploads: &'a U,
    archive: &'a SnapshotArchive<A, C>,
    history: &'a H,
}

impl<'a, S, U, A, C, H> BackupService<'a, S, U, A, C, H>
where
    S: EntityStore + ?Sized,
    U: BlobStore + ?Sized,
    A: BlobStore,
    C: CompressionAdapter,
    H: BackupHistory + ?Sized,
{
    pub fn new(
        store: &'a S,
        uploads: &'a U,
        archive: &'a SnapshotArchive<A, C>,
        history: &'a H,
    ) -> Self {
        Self {
            store,
            uploads,
            archive,
            history,
        }
    }

    /// Build, archive and record a backup.
    pub fn create_backup(&self, request: &BuildRequest) -> Result<BackupRecord> {
        let built = SnapshotBuilder::new(self.store, self.uploads).build(request)?;
        let record = self.archive.write(&built)?;
        self.history
            .record_backup(&record.filename, record.size_bytes, &record.stats)?;
        Ok(record)
    }

    /// Validate and restore an uploaded archive (plain or gzipped JSON).
    pub fn restore_from_bytes(&self, bytes: &[u8], lock: &RestoreLock) -> Result<RestoreReport> {
        let snapshot = decode_snapshot(bytes)?;
        RestoreEngine::new(self.store, self.uploads).restore(&snapshot, lock)
    }

    /// Restore a backup previously recorded in the history ledger.
    pub fn restore_stored(&self, id: &str, lock: &RestoreLock) -> Result<RestoreReport> {
        let bytes = self.history.fetch_stored_snapshot_bytes(id)?;
        info!("Restoring stored backup {}", id);
        self.restore_from_bytes(&bytes, lock)
    }
}
