/*!
# Petstash Core Engine

Export, validation and atomic restore of the pet care dataset: clients,
their pets, appointments, financial transactions, application-owned
auxiliary tables and uploaded files.

## Architecture

The engine follows a ports and adapters layout:
- [`store::EntityStore`] / [`store::SqlExecutor`] reach the live database
  ([`SqliteStore`] is the bundled adapter)
- [`blob::BlobStore`] reaches the shared upload area ([`LocalBlobStore`])
- [`CompressionAdapter`] shapes stored archives ([`GzipCompressor`])

On top of them sit the [`SnapshotBuilder`], the [`SnapshotValidator`] and the
[`RestoreEngine`], wired together by [`BackupService`].

## Usage

```rust
use petstash_core::{
    BuildRequest, LocalBlobStore, RestoreEngine, RestoreLock, SnapshotBuilder,
    SnapshotValidator, SqliteStore,
};

let uploads_dir = tempfile::tempdir()?;
let uploads = LocalBlobStore::with_base_dir(uploads_dir.path());
let source = SqliteStore::open_in_memory("wp_")?;

// Export
let built = SnapshotBuilder::new(&source, &uploads).build(&BuildRequest::all())?;
let bytes = serde_json::to_vec(&built.snapshot)?;

// Validate and restore on another installation
let snapshot = SnapshotValidator::new().validate_bytes(&bytes)?;
let target = SqliteStore::open_in_memory("shop_")?;
let lock = RestoreLock::acquire(uploads_dir.path())?;
let report = RestoreEngine::new(&target, &uploads).restore(&snapshot, &lock)?;
assert!(report.warnings.is_empty());
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod archive;
pub mod blob;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod exporter;
pub mod lock;
pub mod model;
pub mod observability;
pub mod restore;
pub mod store;
pub mod tables;
pub mod validator;
pub mod value;

pub use archive::{BackupHistory, BackupRecord, BackupService, SnapshotArchive};
pub use blob::{BlobStore, LocalBlobStore};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{CompressionKind, PetstashConfig};
pub use error::{PetstashError, Result, ValidationError};
pub use exporter::{BuildRequest, BuiltSnapshot, SnapshotBuilder};
pub use lock::RestoreLock;
pub use model::{
    AuxiliaryTable, BackupStats, BlobFile, Collection, ComponentCounts, EntityKind, EntityRecord,
    Snapshot, TransactionRecord, PLUGIN_ID, SCHEMA_VERSION,
};
pub use observability::{init_observability, init_observability_with_filter};
pub use restore::{PartialDurabilityWarning, RestoreEngine, RestorePhase, RestoreReport};
pub use store::{EntityStore, SqlExecutor, SqliteStore};
pub use tables::TableReflector;
pub use validator::SnapshotValidator;
pub use value::{Meta, MetaValue};
