/*!
Restore engine.

Replaces the application-owned dataset with the content of a validated
snapshot inside one database transaction:

```text
Idle -> Wiping -> RestoringEntities -> RestoringAuxiliaryTables -> RestoringBlobs -> Committed
                 \___________________________ on error ______________________/-> RolledBack
```

Entity kinds are replayed in dependency order (clients, pets, appointments,
transactions) so every reference can be rewritten through the id map of a
kind that was already restored.

Files never touch the upload area before the database commits: decoded
contents are staged in a temporary directory and deletions computed while
wiping are deferred. Both are applied after `COMMIT`; failures at that point
are reported as [`PartialDurabilityWarning`]s instead of errors.
*/

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::blob::{self, BlobStaging, BlobStore, ATTACHMENT_META_KEYS, DOCUMENTS_DIR};
use crate::codec;
use crate::error::ValidationError;
use crate::lock::RestoreLock;
use crate::model::{EntityKind, Snapshot, PLUGIN_ID, SCHEMA_VERSION};
use crate::store::{EntityStore, SqlExecutor, ATTACHED_FILE_KEY, ATTACHMENT_POST_TYPE};
use crate::tables::{self, TableReflector};
use crate::value::MetaValue;
use crate::{PetstashError, Result};

/// Post type prefix shared by every entity kind this application owns.
pub const OWNED_POST_TYPE_PREFIX: &str = "petstash_";

/// Restore state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Wiping,
    RestoringEntities,
    RestoringAuxiliaryTables,
    RestoringBlobs,
    Committed,
    RolledBack,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RestorePhase::Idle => "idle",
            RestorePhase::Wiping => "wiping",
            RestorePhase::RestoringEntities => "restoring entities",
            RestorePhase::RestoringAuxiliaryTables => "restoring auxiliary tables",
            RestorePhase::RestoringBlobs => "restoring blobs",
            RestorePhase::Committed => "committing",
            RestorePhase::RolledBack => "rolling back",
        };
        f.write_str(text)
    }
}

/// A file operation that failed after the database had committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDurabilityWarning {
    pub path: String,
    pub message: String,
}

impl fmt::Display for PartialDurabilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub clients: usize,
    pub pets: usize,
    pub appointments: usize,
    pub transactions: usize,
    pub tables: usize,
    pub table_rows: usize,
    pub files: usize,
    pub attachments: usize,
    /// Snapshot tables outside the reserved prefix, never touched.
    pub skipped_tables: Vec<String>,
    /// References whose target was not part of the snapshot.
    pub unresolved_references: usize,
    pub warnings: Vec<PartialDurabilityWarning>,
}

impl RestoreReport {
    fn record_entity(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Client => self.clients += 1,
            EntityKind::Pet => self.pets += 1,
            EntityKind::Appointment => self.appointments += 1,
            EntityKind::Transaction => self.transactions += 1,
        }
    }
}

/// Old id to new id, per kind.
#[derive(Debug, Default)]
struct IdMaps {
    clients: HashMap<i64, i64>,
    pets: HashMap<i64, i64>,
    appointments: HashMap<i64, i64>,
    attachments: HashMap<i64, i64>,
}

impl IdMaps {
    fn of(&self, kind: EntityKind) -> Option<&HashMap<i64, i64>> {
        match kind {
            EntityKind::Client => Some(&self.clients),
            EntityKind::Pet => Some(&self.pets),
            EntityKind::Appointment => Some(&self.appointments),
            EntityKind::Transaction => None,
        }
    }

    fn of_mut(&mut self, kind: EntityKind) -> Option<&mut HashMap<i64, i64>> {
        match kind {
            EntityKind::Client => Some(&mut self.clients),
            EntityKind::Pet => Some(&mut self.pets),
            EntityKind::Appointment => Some(&mut self.appointments),
            EntityKind::Transaction => None,
        }
    }
}

/// Upload area changes held back until the database commits.
struct PendingFiles {
    deletions: BTreeSet<String>,
    staging: BlobStaging,
}

/// Open database transaction, rolled back on drop unless committed.
struct UnitOfWork<'s, S: SqlExecutor + ?Sized> {
    store: &'s S,
    open: bool,
}

impl<'s, S: SqlExecutor + ?Sized> UnitOfWork<'s, S> {
    fn begin(store: &'s S) -> Result<Self> {
        store.begin()?;
        Ok(Self { store, open: true })
    }

    fn commit(mut self) -> Result<()> {
        self.store.commit()?;
        self.open = false;
        Ok(())
    }
}

impl<S: SqlExecutor + ?Sized> Drop for UnitOfWork<'_, S> {
    fn drop(&mut self) {
        if self.open {
            debug!("Rolling back unfinished transaction");
            if let Err(e) = self.store.rollback() {
                error!("Rollback failed: {}", e);
            }
        }
    }
}

/// Replays snapshots into an [`EntityStore`] and a [`BlobStore`].
pub struct RestoreEngine<'a, S: EntityStore + ?Sized, B: BlobStore + ?Sized> {
    store: &'a S,
    blobs: &'a B,
    phase: RestorePhase,
}

impl<'a, S: EntityStore + ?Sized, B: BlobStore + ?Sized> RestoreEngine<'a, S, B> {
    pub fn new(store: &'a S, blobs: &'a B) -> Self {
        Self {
            store,
            blobs,
            phase: RestorePhase::Idle,
        }
    }

    /// Current (or final) state of the last restore.
    pub fn phase(&self) -> RestorePhase {
        self.phase
    }

    /// Replace the owned dataset with `snapshot`.
    ///
    /// Either every database change is committed or none is. The caller must
    /// hold the restore lock for the duration of the call.
    pub fn restore(&mut self, snapshot: &Snapshot, _lock: &RestoreLock) -> Result<RestoreReport> {
        self.phase = RestorePhase::Idle;
        check_identity(snapshot)?;

        info!(
            "Starting restore of snapshot generated at {}",
            snapshot.generated_at
        );
        self.enter(RestorePhase::Wiping);
        let unit = match UnitOfWork::begin(self.store) {
            Ok(unit) => unit,
            Err(e) => {
                let e = self.failed(e);
                error!("{}", e);
                self.abort();
                return Err(e);
            }
        };

        let mut report = RestoreReport::default();
        let pending = match self.replay(snapshot, &mut report) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Restore failed while {}, rolling back: {}", self.phase, e);
                drop(unit);
                self.abort();
                return Err(e);
            }
        };

        self.enter(RestorePhase::Committed);
        if let Err(e) = unit.commit() {
            let e = self.failed(e);
            error!("{}", e);
            self.abort();
            return Err(e);
        }

        report.warnings = self.apply_files(pending);
        for warning in &report.warnings {
            warn!("File not restored after commit: {}", warning);
        }

        #[cfg(feature = "metrics")]
        crate::observability::PetstashMetrics::global().record_restore(report.files);

        info!(
            "Restore committed: {} clients, {} pets, {} appointments, {} transactions, {} tables, {} files",
            report.clients,
            report.pets,
            report.appointments,
            report.transactions,
            report.tables,
            report.files
        );
        Ok(report)
    }

    fn enter(&mut self, phase: RestorePhase) {
        debug!("Restore phase: {}", phase);
        self.phase = phase;
    }

    fn failed(&self, source: PetstashError) -> PetstashError {
        PetstashError::Restore {
            phase: self.phase,
            source: Box::new(source),
        }
    }

    fn abort(&mut self) {
        self.phase = RestorePhase::RolledBack;

        #[cfg(feature = "metrics")]
        crate::observability::PetstashMetrics::global().record_restore_failure();
    }

    fn replay(&mut self, snapshot: &Snapshot, report: &mut RestoreReport) -> Result<PendingFiles> {
        let deletions = self.wipe().map_err(|e| self.failed(e))?;

        self.enter(RestorePhase::RestoringEntities);
        let mut maps = IdMaps::default();
        self.restore_entities(snapshot, &mut maps, report)
            .map_err(|e| self.failed(e))?;

        self.enter(RestorePhase::RestoringAuxiliaryTables);
        self.restore_tables(snapshot, report)
            .map_err(|e| self.failed(e))?;

        self.enter(RestorePhase::RestoringBlobs);
        let staging = self
            .restore_blobs(snapshot, &mut maps, report)
            .map_err(|e| self.failed(e))?;

        Ok(PendingFiles { deletions, staging })
    }

    /// Delete everything the application owns. Returns the file paths to
    /// remove once committed.
    fn wipe(&self) -> Result<BTreeSet<String>> {
        let owned = self.store.post_ids_by_type_prefix(OWNED_POST_TYPE_PREFIX)?;

        let mut attachments: BTreeSet<i64> = self
            .store
            .attachments_of(&owned)?
            .into_iter()
            .map(|a| a.post.id)
            .collect();
        for id in blob::referenced_attachment_ids(self.store, &owned, &ATTACHMENT_META_KEYS)? {
            if attachments.contains(&id) {
                continue;
            }
            if let Some(post) = self.store.load_post(id)? {
                if post.post.post_type == ATTACHMENT_POST_TYPE {
                    attachments.insert(id);
                }
            }
        }

        let attachment_ids: Vec<i64> = attachments.into_iter().collect();
        let deletions: BTreeSet<String> = self
            .store
            .meta_values(&attachment_ids, ATTACHED_FILE_KEY)?
            .into_iter()
            .filter(|path| blob::sanitize_relative_path(path).is_ok())
            .collect();

        let deleted_attachments = self.store.delete_posts(&attachment_ids)?;
        let deleted_entities = self.store.delete_posts(&owned)?;

        self.store.truncate(&self.store.transactions_table())?;

        let reflector = TableReflector::new(self.store);
        let owned_tables = reflector.owned_tables()?;
        for name in &owned_tables {
            reflector.truncate(name)?;
        }

        info!(
            "Wiped {} entities, {} attachments, {} auxiliary tables",
            deleted_entities,
            deleted_attachments,
            owned_tables.len()
        );
        Ok(deletions)
    }

    fn restore_entities(
        &self,
        snapshot: &Snapshot,
        maps: &mut IdMaps,
        report: &mut RestoreReport,
    ) -> Result<()> {
        for kind in EntityKind::POST_KINDS {
            for record in snapshot.entities(kind) {
                let Some(request) = codec::decode(record, kind) else {
                    continue;
                };
                let (meta, unresolved) = remap_entity_meta(kind, request.meta, maps);
                if unresolved > 0 {
                    warn!(
                        "{} {} has {} reference(s) not present in the snapshot",
                        kind, record.id, unresolved
                    );
                    report.unresolved_references += unresolved;
                }

                let new_id = self.store.insert_post(&request.post)?;
                for (key, value) in &meta {
                    self.store.add_meta(new_id, key, &value.to_stored())?;
                }

                debug!("Restored {} {} as {}", kind, record.id, new_id);
                if let Some(map) = maps.of_mut(kind) {
                    map.insert(record.id, new_id);
                }
                report.record_entity(kind);
            }
        }

        for record in &snapshot.transactions {
            let mut row = codec::sanitize_transaction(record);
            row.cliente_id = row.cliente_id.map(|id| remap_id(id, &maps.clients, report));
            row.agendamento_id = row
                .agendamento_id
                .map(|id| remap_id(id, &maps.appointments, report));

            self.store.insert_transaction(&row)?;
            report.record_entity(EntityKind::Transaction);
        }

        info!(
            "Restored {} clients, {} pets, {} appointments, {} transactions",
            report.clients, report.pets, report.appointments, report.transactions
        );
        Ok(())
    }

    fn restore_tables(&self, snapshot: &Snapshot, report: &mut RestoreReport) -> Result<()> {
        let reflector = TableReflector::new(self.store);
        for table in &snapshot.tables {
            if !tables::is_owned_table(&table.name) {
                warn!("Skipping table '{}': not owned by {}", table.name, PLUGIN_ID);
                report.skipped_tables.push(table.name.clone());
                continue;
            }
            report.table_rows += reflector.recreate(table)?;
            report.tables += 1;
        }
        Ok(())
    }

    fn restore_blobs(
        &self,
        snapshot: &Snapshot,
        maps: &mut IdMaps,
        report: &mut RestoreReport,
    ) -> Result<BlobStaging> {
        let mut staging = BlobStaging::new()?;

        for file in &snapshot.files {
            staging.stage(&file.path, &file.content)?;
            report.files += 1;

            let Some(binding) = &file.attachment else {
                continue;
            };
            let parent = match (binding.parent_kind, binding.parent_id) {
                (Some(kind), Some(old)) => maps
                    .of(kind)
                    .and_then(|map| map.get(&old))
                    .copied()
                    .unwrap_or(0),
                _ => 0,
            };
            let post = codec::decode_post(
                &binding.post,
                ATTACHMENT_POST_TYPE,
                parent,
                &binding.mime_type,
            );
            let new_id = self.store.insert_post(&post)?;
            for (key, value) in &binding.meta {
                if key != ATTACHED_FILE_KEY {
                    self.store.add_meta(new_id, key, &value.to_stored())?;
                }
            }
            self.store.add_meta(new_id, ATTACHED_FILE_KEY, &file.path)?;

            maps.attachments.insert(binding.id, new_id);
            report.attachments += 1;
        }

        if !maps.attachments.is_empty() {
            self.rewrite_attachment_references(maps)?;
        }

        info!(
            "Staged {} files ({} attachments)",
            staging.len(),
            report.attachments
        );
        Ok(staging)
    }

    /// Point entity metadata at the freshly created attachment ids.
    fn rewrite_attachment_references(&self, maps: &IdMaps) -> Result<()> {
        let entity_ids: Vec<i64> = EntityKind::POST_KINDS
            .iter()
            .filter_map(|kind| maps.of(*kind))
            .flat_map(|map| map.values().copied())
            .collect();

        for post_id in entity_ids {
            for key in ATTACHMENT_META_KEYS {
                let values = self.store.meta_values(&[post_id], key)?;
                let Some(raw) = values.first() else {
                    continue;
                };
                let value = MetaValue::from_stored(raw);
                let mut unresolved = 0;
                let rewritten = remap_value(value.clone(), &maps.attachments, false, &mut unresolved);
                if let Some(rewritten) = rewritten.filter(|v| *v != value) {
                    self.store.update_meta(post_id, key, &rewritten.to_stored())?;
                }
            }
        }
        Ok(())
    }

    /// Apply deferred deletions, then promote staged files.
    fn apply_files(&self, pending: PendingFiles) -> Vec<PartialDurabilityWarning> {
        let mut warnings = Vec::new();

        for path in &pending.deletions {
            if let Err(e) = self.blobs.delete(path) {
                warnings.push(PartialDurabilityWarning {
                    path: path.clone(),
                    message: format!("old file could not be removed: {e}"),
                });
            }
        }
        if let Err(e) = self.blobs.clear_dir(DOCUMENTS_DIR) {
            warnings.push(PartialDurabilityWarning {
                path: DOCUMENTS_DIR.to_string(),
                message: format!("document cache could not be cleared: {e}"),
            });
        }

        for (path, e) in pending.staging.promote(self.blobs) {
            warnings.push(PartialDurabilityWarning {
                path,
                message: format!("file could not be written: {e}"),
            });
        }
        warnings
    }
}

fn check_identity(snapshot: &Snapshot) -> Result<()> {
    if snapshot.plugin != PLUGIN_ID {
        return Err(ValidationError::ForeignPlugin {
            found: Some(snapshot.plugin.clone()),
        }
        .into());
    }
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(ValidationError::UnsupportedSchemaVersion {
            found: snapshot.schema_version.to_string(),
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    Ok(())
}

fn remap_id(id: i64, map: &HashMap<i64, i64>, report: &mut RestoreReport) -> i64 {
    match map.get(&id) {
        Some(new_id) => *new_id,
        None => {
            report.unresolved_references += 1;
            id
        }
    }
}

/// Rewrite the reference keys of one entity's metadata.
///
/// Client references keep their raw value when unresolved; pet references on
/// appointments are dropped instead. Returns the number of unresolved ids.
fn remap_entity_meta(
    kind: EntityKind,
    meta: Vec<(String, MetaValue)>,
    maps: &IdMaps,
) -> (Vec<(String, MetaValue)>, usize) {
    let mut unresolved = 0;
    let meta = meta
        .into_iter()
        .filter_map(|(key, value)| {
            let (map, drop_unresolved) = match (kind, key.as_str()) {
                (EntityKind::Pet, "owner_id") => (&maps.clients, false),
                (EntityKind::Appointment, "appointment_client_id") => (&maps.clients, false),
                (EntityKind::Appointment, "appointment_pet_id" | "appointment_pet_ids") => {
                    (&maps.pets, true)
                }
                _ => return Some((key, value)),
            };
            remap_value(value, map, drop_unresolved, &mut unresolved).map(|value| (key, value))
        })
        .collect();
    (meta, unresolved)
}

/// Map ids inside a metadata value. Lists are remapped item by item.
///
/// Returns `None` when the value should be dropped.
fn remap_value(
    value: MetaValue,
    map: &HashMap<i64, i64>,
    drop_unresolved: bool,
    unresolved: &mut usize,
) -> Option<MetaValue> {
    match value {
        MetaValue::List(items) => Some(MetaValue::List(
            items
                .into_iter()
                .filter_map(|item| remap_value(item, map, drop_unresolved, unresolved))
                .collect(),
        )),
        other => match other.as_id() {
            Some(id) => match map.get(&id) {
                Some(new_id) => Some(other.with_id(*new_id)),
                None => {
                    *unresolved += 1;
                    (!drop_unresolved).then_some(other)
                }
            },
            None if drop_unresolved => None,
            None => Some(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maps() -> IdMaps {
        let mut maps = IdMaps::default();
        maps.clients.insert(1, 101);
        maps.pets.insert(5, 105);
        maps.pets.insert(6, 106);
        maps
    }

    fn meta(pairs: &[(&str, MetaValue)]) -> Vec<(String, MetaValue)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn text(s: &str) -> MetaValue {
        MetaValue::String(s.into())
    }

    #[test]
    fn test_unit_of_work_rolls_back_unless_committed() {
        use crate::store::NewPost;
        use crate::SqliteStore;

        let store = SqliteStore::open_in_memory("wp_").unwrap();
        let client = NewPost {
            post_type: "petstash_client".into(),
            title: "Ana".into(),
            ..Default::default()
        };

        {
            let _unit = UnitOfWork::begin(&store).unwrap();
            store.insert_post(&client).unwrap();
        }
        assert_eq!(store.count_entities(EntityKind::Client).unwrap(), 0);

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _unit = UnitOfWork::begin(&store).unwrap();
            store.insert_post(&client).unwrap();
            panic!("replay aborted");
        }));
        assert!(unwound.is_err());
        assert_eq!(store.count_entities(EntityKind::Client).unwrap(), 0);

        let unit = UnitOfWork::begin(&store).unwrap();
        store.insert_post(&client).unwrap();
        unit.commit().unwrap();
        assert_eq!(store.count_entities(EntityKind::Client).unwrap(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RestorePhase::Wiping.to_string(), "wiping");
        assert_eq!(RestorePhase::RestoringBlobs.to_string(), "restoring blobs");
    }

    #[test]
    fn test_pet_owner_is_remapped_or_kept_raw() {
        let maps = maps();
        let (out, unresolved) =
            remap_entity_meta(EntityKind::Pet, meta(&[("owner_id", text("1"))]), &maps);
        assert_eq!(out, meta(&[("owner_id", text("101"))]));
        assert_eq!(unresolved, 0);

        let (out, unresolved) = remap_entity_meta(
            EntityKind::Pet,
            meta(&[("owner_id", MetaValue::Number(7.into()))]),
            &maps,
        );
        assert_eq!(out, meta(&[("owner_id", MetaValue::Number(7.into()))]));
        assert_eq!(unresolved, 1);
    }

    #[test]
    fn test_appointment_pet_references() {
        let maps = maps();
        let (out, unresolved) = remap_entity_meta(
            EntityKind::Appointment,
            meta(&[
                ("appointment_client_id", text("1")),
                (
                    "appointment_pet_ids",
                    MetaValue::List(vec![text("5"), text("99"), text("6")]),
                ),
                ("appointment_pet_id", text("99")),
                ("appointment_services", MetaValue::List(vec![text("bath")])),
            ]),
            &maps,
        );

        assert_eq!(
            out,
            meta(&[
                ("appointment_client_id", text("101")),
                (
                    "appointment_pet_ids",
                    MetaValue::List(vec![text("105"), text("106")])
                ),
                ("appointment_services", MetaValue::List(vec![text("bath")])),
            ])
        );
        assert_eq!(unresolved, 2);
    }

    #[test]
    fn test_other_kinds_leave_reference_keys_alone() {
        let maps = maps();
        let (out, unresolved) =
            remap_entity_meta(EntityKind::Client, meta(&[("owner_id", text("1"))]), &maps);
        assert_eq!(out, meta(&[("owner_id", text("1"))]));
        assert_eq!(unresolved, 0);
    }

    #[test]
    fn test_remap_id_counts_misses() {
        let maps = maps();
        let mut report = RestoreReport::default();
        assert_eq!(remap_id(1, &maps.clients, &mut report), 101);
        assert_eq!(remap_id(2, &maps.clients, &mut report), 2);
        assert_eq!(report.unresolved_references, 1);
    }

    #[test]
    fn test_identity_guard() {
        let mut snapshot = Snapshot::empty();
        assert!(check_identity(&snapshot).is_ok());
        snapshot.schema_version = 2;
        assert!(check_identity(&snapshot).unwrap_err().is_validation());
    }
}
