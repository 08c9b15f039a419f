/*!
Snapshot builder.

Assembles one [`Snapshot`] from the live dataset. Read-only: nothing here
writes to the store or the upload area.
*/

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::blob::{self, BlobStore, ATTACHMENT_META_KEYS, DOCUMENTS_DIR};
use crate::codec;
use crate::model::{BackupStats, Collection, ComponentCounts, EntityKind, Snapshot};
use crate::store::EntityStore;
use crate::tables::TableReflector;
use crate::{PetstashError, Result};

/// Which entity collections to include in a snapshot.
///
/// Auxiliary tables and files are always included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    collections: BTreeSet<Collection>,
}

impl BuildRequest {
    pub fn all() -> Self {
        Self {
            collections: Collection::ALL.into_iter().collect(),
        }
    }

    /// Build a request from collection names.
    ///
    /// Unknown names are ignored. When nothing recognizable remains every
    /// collection is selected.
    pub fn from_names<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let collections: BTreeSet<Collection> = names
            .into_iter()
            .filter_map(|name| Collection::parse(name.as_ref()))
            .collect();

        if collections.is_empty() {
            Self::all()
        } else {
            Self { collections }
        }
    }

    pub fn includes(&self, kind: EntityKind) -> bool {
        self.collections.iter().any(|c| c.kind() == kind)
    }

    /// Selected collection names, in snapshot order.
    pub fn names(&self) -> Vec<String> {
        self.collections
            .iter()
            .map(|c| c.kind().block().to_string())
            .collect()
    }
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self::all()
    }
}

/// Output of [`SnapshotBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltSnapshot {
    pub snapshot: Snapshot,
    pub counts: ComponentCounts,
    pub stats: BackupStats,
}

/// Builds snapshots from an entity store and a blob store.
pub struct SnapshotBuilder<'a, S: EntityStore + ?Sized, B: BlobStore + ?Sized> {
    store: &'a S,
    blobs: &'a B,
}

impl<'a, S: EntityStore + ?Sized, B: BlobStore + ?Sized> SnapshotBuilder<'a, S, B> {
    pub fn new(store: &'a S, blobs: &'a B) -> Self {
        Self { store, blobs }
    }

    /// Assemble a full snapshot of the selected collections.
    ///
    /// Any unreadable entity, table or file fails the whole build.
    pub fn build(&self, request: &BuildRequest) -> Result<BuiltSnapshot> {
        let mut snapshot = Snapshot::empty();
        let mut owners: BTreeMap<i64, EntityKind> = BTreeMap::new();

        for kind in EntityKind::POST_KINDS {
            if !request.includes(kind) {
                continue;
            }
            let stored = self
                .store
                .list_entities(kind)
                .map_err(|e| export_error(kind.block(), e))?;

            if let Some(records) = snapshot.entities_mut(kind) {
                for entity in &stored {
                    owners.insert(entity.post.id, kind);
                    records.push(codec::encode(entity));
                }
            }
            debug!("Exported {} {}", stored.len(), kind);
        }

        if request.includes(EntityKind::Transaction) {
            snapshot.transactions = self
                .store
                .list_transactions()
                .map_err(|e| export_error("transactions", e))?;
        }

        snapshot.tables = TableReflector::new(self.store)
            .capture()
            .map_err(|e| export_error("auxiliary tables", e))?;

        let mut files =
            blob::read_attachments(self.store, self.blobs, &owners, &ATTACHMENT_META_KEYS)
                .map_err(|e| export_error("attachments", e))?;
        files.extend(blob::read_documents(self.blobs).map_err(|e| export_error("documents", e))?);
        snapshot.files = files;

        let counts = ComponentCounts::of(&snapshot);
        let stats = BackupStats {
            generated_at: snapshot.generated_at,
            collections: request.names(),
            counts,
            table_rows: snapshot.tables.iter().map(|t| t.rows.len()).sum(),
            file_bytes: snapshot
                .files
                .iter()
                .map(|f| blob::decoded_len(&f.content))
                .sum(),
            checksum: None,
        };

        info!(
            "Built snapshot: {} clients, {} pets, {} appointments, {} transactions, {} tables, {} files",
            counts.clients,
            counts.pets,
            counts.appointments,
            counts.transactions,
            counts.tables,
            counts.files
        );

        Ok(BuiltSnapshot {
            snapshot,
            counts,
            stats,
        })
    }

    /// Per-collection totals of the live dataset.
    pub fn live_counts(&self) -> Result<ComponentCounts> {
        let mut owned_ids = Vec::new();
        for kind in EntityKind::POST_KINDS {
            if let Some(post_type) = kind.post_type() {
                owned_ids.extend(self.store.post_ids_by_type_prefix(post_type)?);
            }
        }

        let attachments = self.store.attachments_of(&owned_ids)?.len();
        let documents = self.blobs.list(DOCUMENTS_DIR)?.len();

        Ok(ComponentCounts {
            clients: self.store.count_entities(EntityKind::Client)?,
            pets: self.store.count_entities(EntityKind::Pet)?,
            appointments: self.store.count_entities(EntityKind::Appointment)?,
            transactions: self.store.count_transactions()?,
            tables: TableReflector::new(self.store).owned_tables()?.len(),
            files: attachments + documents,
        })
    }
}

fn export_error(what: &str, source: PetstashError) -> PetstashError {
    PetstashError::export(format!("could not read {what}: {source}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::store::{NewPost, SqlExecutor, SqliteStore, ATTACHED_FILE_KEY, ATTACHMENT_POST_TYPE};
    use crate::model::TransactionRecord;
    use crate::value::MetaValue;
    use tempfile::TempDir;

    fn post(kind: EntityKind, title: &str) -> NewPost {
        NewPost {
            post_type: kind.post_type().unwrap().into(),
            title: title.into(),
            status: "publish".into(),
            date: "2024-03-01 10:00:00".into(),
            modified: "2024-03-01 10:00:00".into(),
            ..Default::default()
        }
    }

    fn seeded() -> (SqliteStore, TempDir, LocalBlobStore) {
        let store = SqliteStore::open_in_memory("wp_").unwrap();
        let uploads = TempDir::new().unwrap();
        let blobs = LocalBlobStore::with_base_dir(uploads.path());

        let ana = store.insert_post(&post(EntityKind::Client, "Ana")).unwrap();
        let rex = store.insert_post(&post(EntityKind::Pet, "Rex")).unwrap();
        store.add_meta(rex, "owner_id", &ana.to_string()).unwrap();

        let photo = store
            .insert_post(&NewPost {
                post_type: ATTACHMENT_POST_TYPE.into(),
                parent: rex,
                mime_type: "image/png".into(),
                ..Default::default()
            })
            .unwrap();
        store.add_meta(photo, ATTACHED_FILE_KEY, "2024/rex.png").unwrap();
        blobs.save(b"png", "2024/rex.png").unwrap();
        blobs.save(b"<html>", "petstash-documents/invoice-1.html").unwrap();

        store
            .insert_transaction(&TransactionRecord {
                cliente_id: Some(ana),
                valor: 80.0,
                status: "pago".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .execute("CREATE TABLE wp_petstash_loyalty (id INTEGER PRIMARY KEY, points INTEGER)")
            .unwrap();
        store
            .execute("INSERT INTO wp_petstash_loyalty (points) VALUES (10), (20)")
            .unwrap();

        (store, uploads, blobs)
    }

    #[test]
    fn test_build_request_names() {
        let request = BuildRequest::from_names(["pets", "invoices", "Clients"]);
        assert!(request.includes(EntityKind::Pet));
        assert!(request.includes(EntityKind::Client));
        assert!(!request.includes(EntityKind::Transaction));
        assert_eq!(request.names(), vec!["clients", "pets"]);

        assert_eq!(BuildRequest::from_names(Vec::<String>::new()), BuildRequest::all());
        assert_eq!(BuildRequest::from_names(["nope"]), BuildRequest::all());
    }

    #[test]
    fn test_build_full_snapshot() {
        let (store, _uploads, blobs) = seeded();
        let built = SnapshotBuilder::new(&store, &blobs)
            .build(&BuildRequest::all())
            .unwrap();

        assert_eq!(built.snapshot.plugin, "petstash");
        assert_eq!(built.counts.clients, 1);
        assert_eq!(built.counts.pets, 1);
        assert_eq!(built.counts.transactions, 1);
        assert_eq!(built.counts.tables, 1);
        assert_eq!(built.counts.files, 2);
        assert_eq!(built.stats.table_rows, 2);
        assert_eq!(built.stats.file_bytes, 9);

        let rex = &built.snapshot.pets[0];
        assert_eq!(
            rex.meta["owner_id"],
            MetaValue::String(built.snapshot.clients[0].id.to_string())
        );
        let photo = built
            .snapshot
            .files
            .iter()
            .find(|f| f.path == "2024/rex.png")
            .unwrap();
        assert_eq!(photo.attachment.as_ref().unwrap().parent_kind, Some(EntityKind::Pet));
    }

    #[test]
    fn test_selection_still_includes_tables_and_documents() {
        let (store, _uploads, blobs) = seeded();
        let built = SnapshotBuilder::new(&store, &blobs)
            .build(&BuildRequest::from_names(["clients"]))
            .unwrap();

        assert_eq!(built.counts.clients, 1);
        assert_eq!(built.counts.pets, 0);
        assert_eq!(built.counts.transactions, 0);
        assert_eq!(built.counts.tables, 1);
        // The pet photo belongs to an unselected collection.
        assert_eq!(built.counts.files, 1);
    }

    #[test]
    fn test_missing_file_fails_the_build() {
        let (store, uploads, blobs) = seeded();
        std::fs::remove_file(uploads.path().join("2024/rex.png")).unwrap();

        let result = SnapshotBuilder::new(&store, &blobs).build(&BuildRequest::all());
        assert!(matches!(result, Err(PetstashError::Export(_))));
    }

    #[test]
    fn test_live_counts_match_build() {
        let (store, _uploads, blobs) = seeded();
        let builder = SnapshotBuilder::new(&store, &blobs);
        let built = builder.build(&BuildRequest::all()).unwrap();
        assert_eq!(builder.live_counts().unwrap(), built.counts);
    }
}
