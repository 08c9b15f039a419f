/*!
End-to-end tests: export from one installation, validate, restore into another.

Every test runs against real in-memory SQLite stores and temporary upload
directories.
*/

use petstash_core::blob::{BlobStore, LocalBlobStore};
use petstash_core::model::{CellValue, TransactionRecord};
use petstash_core::store::{NewPost, StoredPost, ATTACHED_FILE_KEY, ATTACHMENT_POST_TYPE};
use petstash_core::{
    BuildRequest, EntityKind, EntityStore, MetaValue, PetstashError, RestoreEngine, RestoreLock,
    RestorePhase, RestoreReport, Result, SnapshotBuilder, SnapshotValidator, SqlExecutor,
    SqliteStore,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;

struct Site {
    _dir: TempDir,
    root: PathBuf,
    store: SqliteStore,
    uploads: LocalBlobStore,
}

fn site(prefix: &str) -> Site {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    Site {
        store: SqliteStore::open_in_memory(prefix).unwrap(),
        uploads: LocalBlobStore::with_base_dir(&root),
        root,
        _dir: dir,
    }
}

fn entity(kind: EntityKind, title: &str) -> NewPost {
    NewPost {
        post_type: kind.post_type().unwrap().to_string(),
        title: title.to_string(),
        status: "publish".to_string(),
        date: "2024-03-01 09:00:00".to_string(),
        modified: "2024-03-01 09:00:00".to_string(),
        ..Default::default()
    }
}

fn attachment(parent: i64, path: &str, site: &Site, bytes: &[u8]) -> i64 {
    let id = site
        .store
        .insert_post(&NewPost {
            post_type: ATTACHMENT_POST_TYPE.to_string(),
            title: path.to_string(),
            parent,
            mime_type: "image/jpeg".to_string(),
            ..Default::default()
        })
        .unwrap();
    site.store.add_meta(id, ATTACHED_FILE_KEY, path).unwrap();
    site.uploads.save(bytes, path).unwrap();
    id
}

fn restore_value(site: &Site, document: Value) -> Result<RestoreReport> {
    let snapshot = SnapshotValidator::new().validate_value(document)?;
    let lock = RestoreLock::acquire(&site.root)?;
    RestoreEngine::new(&site.store, &site.uploads).restore(&snapshot, &lock)
}

fn find(store: &SqliteStore, kind: EntityKind, title: &str) -> StoredPost {
    store
        .list_entities(kind)
        .unwrap()
        .into_iter()
        .find(|e| e.post.title == title)
        .unwrap_or_else(|| panic!("no {kind} titled {title}"))
}

fn meta(post: &StoredPost, key: &str) -> Option<String> {
    post.meta_value(key).map(str::to_string)
}

/// Non-application posts, so restored ids cannot coincide with source ids.
fn shift_ids(site: &Site, count: usize) {
    for i in 0..count {
        site.store
            .insert_post(&NewPost {
                post_type: "page".to_string(),
                title: format!("page {i}"),
                ..Default::default()
            })
            .unwrap();
    }
}

fn ana_rex_document() -> Value {
    json!({
        "plugin": "petstash",
        "schema_version": 1,
        "generated_at": "2024-03-01T10:00:00Z",
        "clients": [
            {"id": 1, "post": {"title": "Ana", "status": "publish"}, "meta": {"client_phone": "555-0101"}}
        ],
        "pets": [
            {"id": 5, "post": {"title": "Rex", "status": "publish"}, "meta": {"owner_id": 1}}
        ],
        "appointments": [
            {"id": 9, "post": {"title": "Bath", "status": "publish"},
             "meta": {"appointment_client_id": 1, "appointment_pet_id": 5}}
        ],
        "transactions": [],
        "tables": [],
        "files": []
    })
}

#[test]
fn test_ana_rex_scenario() {
    let target = site("wp_");
    shift_ids(&target, 20);

    let report = restore_value(&target, ana_rex_document()).unwrap();
    assert_eq!((report.clients, report.pets, report.appointments), (1, 1, 1));
    assert_eq!(report.unresolved_references, 0);

    let clients = target.store.list_entities(EntityKind::Client).unwrap();
    assert_eq!(clients.len(), 1);
    let ana = &clients[0];
    assert_eq!(ana.post.title, "Ana");
    let c = ana.post.id.to_string();
    assert_ne!(c, "1");

    let pets = target.store.list_entities(EntityKind::Pet).unwrap();
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0].post.title, "Rex");
    assert_eq!(meta(&pets[0], "owner_id"), Some(c.clone()));

    let appointments = target.store.list_entities(EntityKind::Appointment).unwrap();
    assert_eq!(appointments.len(), 1);
    assert_eq!(meta(&appointments[0], "appointment_client_id"), Some(c));
    assert_eq!(
        meta(&appointments[0], "appointment_pet_id"),
        Some(pets[0].post.id.to_string())
    );
}

#[test]
fn test_id_remapping_uses_new_client_id() {
    let target = site("wp_");
    shift_ids(&target, 7);

    let mut document = ana_rex_document();
    document["clients"][0]["id"] = json!(7);
    document["pets"][0]["meta"]["owner_id"] = json!("7");
    document["appointments"] = json!([]);

    restore_value(&target, document).unwrap();

    let ana = find(&target.store, EntityKind::Client, "Ana");
    let rex = find(&target.store, EntityKind::Pet, "Rex");
    assert_ne!(ana.post.id, 7);
    assert_eq!(meta(&rex, "owner_id"), Some(ana.post.id.to_string()));
}

#[test]
fn test_unresolvable_pet_reference_is_dropped() {
    let target = site("wp_");

    let mut document = ana_rex_document();
    document["appointments"] = json!([
        {"id": 9, "post": {"title": "Bath"},
         "meta": {"appointment_client_id": 1, "appointment_pet_id": 404}},
        {"id": 10, "post": {"title": "Groom"},
         "meta": {"appointment_client_id": 3, "appointment_pet_ids": ["5", "404"]}}
    ]);

    let report = restore_value(&target, document).unwrap();
    assert_eq!(report.appointments, 2);
    assert_eq!(report.unresolved_references, 3);

    let rex = find(&target.store, EntityKind::Pet, "Rex");
    let bath = find(&target.store, EntityKind::Appointment, "Bath");
    assert_eq!(meta(&bath, "appointment_pet_id"), None);
    assert!(meta(&bath, "appointment_client_id").is_some());

    let groom = find(&target.store, EntityKind::Appointment, "Groom");
    assert_eq!(
        MetaValue::from_stored(&meta(&groom, "appointment_pet_ids").unwrap()),
        MetaValue::List(vec![MetaValue::String(rex.post.id.to_string())])
    );
    // Unknown client ids keep their raw value.
    assert_eq!(meta(&groom, "appointment_client_id"), Some("3".to_string()));
}

#[test]
fn test_full_round_trip_between_installations() {
    let source = site("wp_");
    let ana = source.store.insert_post(&entity(EntityKind::Client, "Ana")).unwrap();
    let rex = source.store.insert_post(&entity(EntityKind::Pet, "Rex")).unwrap();
    let mia = source.store.insert_post(&entity(EntityKind::Pet, "Mia")).unwrap();
    let bath = source
        .store
        .insert_post(&entity(EntityKind::Appointment, "Bath"))
        .unwrap();

    source.store.add_meta(ana, "client_phone", "555-0101").unwrap();
    source.store.add_meta(rex, "owner_id", &ana.to_string()).unwrap();
    source.store.add_meta(rex, "pet_vaccines", r#"["rabies","v10"]"#).unwrap();
    source.store.add_meta(mia, "owner_id", &ana.to_string()).unwrap();
    source
        .store
        .add_meta(bath, "appointment_client_id", &ana.to_string())
        .unwrap();
    source
        .store
        .add_meta(bath, "appointment_pet_ids", &format!(r#"["{rex}","{mia}"]"#))
        .unwrap();

    let rex_photo = attachment(rex, "2024/03/rex.jpg", &source, b"rex-jpeg");
    source.store.add_meta(rex, "pet_photo_id", &rex_photo.to_string()).unwrap();
    let ana_photo = attachment(0, "2024/03/ana.jpg", &source, b"ana-jpeg");
    source.store.add_meta(ana, "client_photo_id", &ana_photo.to_string()).unwrap();
    source
        .uploads
        .save(b"<h1>Invoice</h1>", "petstash-documents/invoice-1.html")
        .unwrap();

    source
        .store
        .insert_transaction(&TransactionRecord {
            cliente_id: Some(ana),
            agendamento_id: Some(bath),
            plano_id: Some(77),
            data: Some("2024-03-01".to_string()),
            valor: 80.5,
            categoria: "Banho".to_string(),
            tipo: "receita".to_string(),
            status: "pago".to_string(),
            descricao: "Banho Rex".to_string(),
            ..Default::default()
        })
        .unwrap();

    source
        .store
        .execute("CREATE TABLE wp_petstash_loyalty (id INTEGER PRIMARY KEY, client_id INTEGER, points REAL)")
        .unwrap();
    source
        .store
        .execute("INSERT INTO wp_petstash_loyalty (client_id, points) VALUES (1, 10.5), (1, 4)")
        .unwrap();

    let built = SnapshotBuilder::new(&source.store, &source.uploads)
        .build(&BuildRequest::all())
        .unwrap();
    let bytes = serde_json::to_vec(&built.snapshot).unwrap();

    let target = site("shop_");
    shift_ids(&target, 11);
    let snapshot = SnapshotValidator::new().validate_bytes(&bytes).unwrap();
    let lock = RestoreLock::acquire(&target.root).unwrap();
    let mut engine = RestoreEngine::new(&target.store, &target.uploads);
    let report = engine.restore(&snapshot, &lock).unwrap();

    assert_eq!(engine.phase(), RestorePhase::Committed);
    assert!(report.warnings.is_empty());
    assert_eq!(report.unresolved_references, 0);
    assert_eq!(report.files, 3);
    assert_eq!(report.attachments, 2);

    let new_ana = find(&target.store, EntityKind::Client, "Ana");
    let new_rex = find(&target.store, EntityKind::Pet, "Rex");
    let new_mia = find(&target.store, EntityKind::Pet, "Mia");
    let new_bath = find(&target.store, EntityKind::Appointment, "Bath");
    let c = new_ana.post.id.to_string();

    assert_eq!(meta(&new_ana, "client_phone"), Some("555-0101".to_string()));
    assert_eq!(meta(&new_rex, "owner_id"), Some(c.clone()));
    assert_eq!(meta(&new_mia, "owner_id"), Some(c.clone()));
    assert_eq!(meta(&new_bath, "appointment_client_id"), Some(c));
    assert_eq!(
        MetaValue::from_stored(&meta(&new_bath, "appointment_pet_ids").unwrap()),
        MetaValue::List(vec![
            MetaValue::String(new_rex.post.id.to_string()),
            MetaValue::String(new_mia.post.id.to_string()),
        ])
    );
    assert_eq!(
        MetaValue::from_stored(&meta(&new_rex, "pet_vaccines").unwrap()),
        MetaValue::List(vec![
            MetaValue::String("rabies".to_string()),
            MetaValue::String("v10".to_string()),
        ])
    );

    let transactions = target.store.list_transactions().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].cliente_id, Some(new_ana.post.id));
    assert_eq!(transactions[0].agendamento_id, Some(new_bath.post.id));
    assert_eq!(transactions[0].plano_id, Some(77));
    assert_eq!(transactions[0].valor, 80.5);

    // Attachment posts are recreated under the new parent and references follow them.
    let photo_id: i64 = meta(&new_rex, "pet_photo_id").unwrap().parse().unwrap();
    let photo = target.store.load_post(photo_id).unwrap().unwrap();
    assert_eq!(photo.post.parent, new_rex.post.id);
    assert_eq!(photo.meta_value(ATTACHED_FILE_KEY), Some("2024/03/rex.jpg"));
    let ana_photo_id: i64 = meta(&new_ana, "client_photo_id").unwrap().parse().unwrap();
    let ana_photo_post = target.store.load_post(ana_photo_id).unwrap().unwrap();
    assert_eq!(ana_photo_post.meta_value(ATTACHED_FILE_KEY), Some("2024/03/ana.jpg"));

    assert_eq!(target.uploads.load("2024/03/rex.jpg").unwrap(), b"rex-jpeg");
    assert_eq!(target.uploads.load("2024/03/ana.jpg").unwrap(), b"ana-jpeg");
    assert_eq!(
        target.uploads.load("petstash-documents/invoice-1.html").unwrap(),
        b"<h1>Invoice</h1>"
    );

    let rows = target.store.fetch_rows("shop_petstash_loyalty").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["points"], CellValue::Real(10.5));

    // Exporting the restored installation yields the same shape.
    let again = SnapshotBuilder::new(&target.store, &target.uploads)
        .build(&BuildRequest::all())
        .unwrap();
    assert_eq!(again.counts, built.counts);
}

#[test]
fn test_restore_replaces_instead_of_merging() {
    let target = site("wp_");
    restore_value(&target, ana_rex_document()).unwrap();
    restore_value(&target, ana_rex_document()).unwrap();

    assert_eq!(target.store.count_entities(EntityKind::Client).unwrap(), 1);
    assert_eq!(target.store.count_entities(EntityKind::Pet).unwrap(), 1);
    assert_eq!(target.store.count_entities(EntityKind::Appointment).unwrap(), 1);
}

#[test]
fn test_failure_in_second_auxiliary_table_rolls_back_everything() {
    let target = site("wp_");
    let old = target.store.insert_post(&entity(EntityKind::Client, "Old")).unwrap();
    target.store.add_meta(old, "client_phone", "1").unwrap();
    target
        .store
        .insert_transaction(&TransactionRecord {
            cliente_id: Some(old),
            valor: 10.0,
            ..Default::default()
        })
        .unwrap();
    target
        .store
        .execute("CREATE TABLE wp_petstash_loyalty (id INTEGER PRIMARY KEY, points INTEGER)")
        .unwrap();
    target
        .store
        .execute("INSERT INTO wp_petstash_loyalty (points) VALUES (5)")
        .unwrap();

    let id_column = json!({"name": "id", "type": "INTEGER", "not_null": false, "default": null, "primary_key": 1});
    let mut document = ana_rex_document();
    document["transactions"] = json!([{"cliente_id": 1, "valor": 99.0, "status": "pago"}]);
    document["tables"] = json!([
        {"name": "petstash_alpha", "schema": "", "columns": [id_column.clone()], "rows": [{"id": 1}]},
        {"name": "petstash_beta", "schema": "", "columns": [id_column], "rows": [{"id": 1, "missing": 2}]}
    ]);

    let snapshot = SnapshotValidator::new().validate_value(document).unwrap();
    let lock = RestoreLock::acquire(&target.root).unwrap();
    let mut engine = RestoreEngine::new(&target.store, &target.uploads);
    let err = engine.restore(&snapshot, &lock).unwrap_err();

    assert!(matches!(
        err,
        PetstashError::Restore {
            phase: RestorePhase::RestoringAuxiliaryTables,
            ..
        }
    ));
    assert_eq!(engine.phase(), RestorePhase::RolledBack);

    let clients = target.store.list_entities(EntityKind::Client).unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].post.title, "Old");
    assert_eq!(target.store.count_entities(EntityKind::Pet).unwrap(), 0);
    assert_eq!(target.store.count_entities(EntityKind::Appointment).unwrap(), 0);

    let transactions = target.store.list_transactions().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].cliente_id, Some(old));

    assert!(!target.store.table_exists("wp_petstash_alpha").unwrap());
    assert_eq!(target.store.fetch_rows("wp_petstash_loyalty").unwrap().len(), 1);
}

#[test]
fn test_unsupported_schema_version_is_rejected_without_mutation() {
    let target = site("wp_");
    target.store.insert_post(&entity(EntityKind::Client, "Old")).unwrap();

    let mut document = ana_rex_document();
    document["schema_version"] = json!(2);

    let err = restore_value(&target, document).unwrap_err();
    assert!(err.is_validation());

    let clients = target.store.list_entities(EntityKind::Client).unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].post.title, "Old");
}

#[test]
fn test_unowned_tables_are_never_touched() {
    let target = site("wp_");
    target
        .store
        .execute("CREATE TABLE wp_users (id INTEGER PRIMARY KEY, login TEXT)")
        .unwrap();
    target
        .store
        .execute("INSERT INTO wp_users (login) VALUES ('admin')")
        .unwrap();

    let mut document = ana_rex_document();
    document["tables"] = json!([
        {"name": "users", "schema": "CREATE TABLE {{table_prefix}}users (id INTEGER PRIMARY KEY, login TEXT)",
         "rows": [{"id": 1, "login": "intruder"}]},
        {"name": "../wp_users", "schema": "", "rows": []}
    ]);

    let report = restore_value(&target, document).unwrap();
    assert_eq!(report.skipped_tables, vec!["users".to_string(), "../wp_users".to_string()]);
    assert_eq!(report.tables, 0);

    let rows = target.store.fetch_rows("wp_users").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["login"], CellValue::Text("admin".to_string()));
}

#[test]
fn test_bad_file_rolls_back_and_leaves_uploads_untouched() {
    let target = site("wp_");
    let old_pet = target.store.insert_post(&entity(EntityKind::Pet, "Old")).unwrap();
    attachment(old_pet, "2023/old.jpg", &target, b"old");

    for files in [
        json!([{"path": "2024/a.png", "content": "aGVsbG8="}, {"path": "2024/b.png", "content": "***"}]),
        json!([{"path": "2024/a.png", "content": "aGVsbG8="}, {"path": "../escape.png", "content": "aGVsbG8="}]),
    ] {
        let mut document = ana_rex_document();
        document["files"] = files;

        let err = restore_value(&target, document).unwrap_err();
        assert!(matches!(
            err,
            PetstashError::Restore {
                phase: RestorePhase::RestoringBlobs,
                ..
            }
        ));

        assert!(target.uploads.exists("2023/old.jpg"));
        assert!(!target.uploads.exists("2024/a.png"));
        assert!(!target.root.parent().unwrap().join("escape.png").exists());
        assert_eq!(target.store.count_entities(EntityKind::Pet).unwrap(), 1);
        assert_eq!(find(&target.store, EntityKind::Pet, "Old").post.id, old_pet);
    }
}

#[test]
fn test_wipe_removes_old_attachment_files_after_commit() {
    let target = site("wp_");
    let old_pet = target.store.insert_post(&entity(EntityKind::Pet, "Old")).unwrap();
    let photo = attachment(old_pet, "2023/old.jpg", &target, b"old");
    target
        .uploads
        .save(b"stale", "petstash-documents/invoice-0.html")
        .unwrap();
    target.uploads.save(b"keep", "2023/unrelated.jpg").unwrap();

    restore_value(&target, ana_rex_document()).unwrap();

    assert!(target.store.load_post(photo).unwrap().is_none());
    assert!(!target.uploads.exists("2023/old.jpg"));
    assert!(!target.uploads.exists("petstash-documents/invoice-0.html"));
    assert!(target.uploads.exists("2023/unrelated.jpg"));
}

/// Upload area that refuses to write one path.
struct FlakyUploads {
    inner: LocalBlobStore,
    broken: &'static str,
}

impl BlobStore for FlakyUploads {
    fn save(&self, data: &[u8], path: &str) -> Result<()> {
        if path == self.broken {
            return Err(PetstashError::storage("disk full"));
        }
        self.inner.save(data, path)
    }

    fn load(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.load(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.inner.list(dir)
    }

    fn clear_dir(&self, dir: &str) -> Result<()> {
        self.inner.clear_dir(dir)
    }
}

#[test]
fn test_post_commit_file_failures_become_warnings() {
    let target = site("wp_");
    let uploads = FlakyUploads {
        inner: LocalBlobStore::with_base_dir(&target.root),
        broken: "2024/b.png",
    };

    let mut document = ana_rex_document();
    document["files"] = json!([
        {"path": "2024/a.png", "content": "aGVsbG8="},
        {"path": "2024/b.png", "content": "aGVsbG8="}
    ]);
    let snapshot = SnapshotValidator::new().validate_value(document).unwrap();
    let lock = RestoreLock::acquire(&target.root).unwrap();

    let report = RestoreEngine::new(&target.store, &uploads)
        .restore(&snapshot, &lock)
        .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].path, "2024/b.png");
    assert!(uploads.exists("2024/a.png"));
    assert_eq!(target.store.count_entities(EntityKind::Client).unwrap(), 1);
}

#[test]
fn test_second_restore_cannot_take_the_lock() {
    let target = site("wp_");
    let _held = RestoreLock::acquire(&target.root).unwrap();

    let err = restore_value(&target, ana_rex_document()).unwrap_err();
    assert!(matches!(err, PetstashError::Storage(_)));
    assert_eq!(target.store.count_entities(EntityKind::Client).unwrap(), 0);
}

#[test]
fn test_failed_begin_ends_rolled_back() {
    let target = site("wp_");
    target.store.begin().unwrap();

    let snapshot = SnapshotValidator::new()
        .validate_value(ana_rex_document())
        .unwrap();
    let lock = RestoreLock::acquire(&target.root).unwrap();
    let mut engine = RestoreEngine::new(&target.store, &target.uploads);

    let err = engine.restore(&snapshot, &lock).unwrap_err();
    assert!(matches!(
        err,
        PetstashError::Restore {
            phase: RestorePhase::Wiping,
            ..
        }
    ));
    assert_eq!(engine.phase(), RestorePhase::RolledBack);
}
