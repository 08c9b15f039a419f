/*!
Snapshot document schema.

The JSON layout produced here is the portable backup format:

```text
{ plugin, schema_version, generated_at,
  clients, pets, appointments, transactions, tables, files }
```
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::value::{deserialize_meta, Meta};

/// Identity tag written into every snapshot.
pub const PLUGIN_ID: &str = "petstash";

/// The only snapshot schema version this engine reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Business entity kinds, in restore dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Pet,
    Appointment,
    Transaction,
}

impl EntityKind {
    /// Kinds stored as posts, in the order they must be restored.
    pub const POST_KINDS: [EntityKind; 3] =
        [EntityKind::Client, EntityKind::Pet, EntityKind::Appointment];

    /// Post type for kinds backed by the posts table.
    pub fn post_type(self) -> Option<&'static str> {
        match self {
            EntityKind::Client => Some("petstash_client"),
            EntityKind::Pet => Some("petstash_pet"),
            EntityKind::Appointment => Some("petstash_appointment"),
            EntityKind::Transaction => None,
        }
    }

    /// Name of the snapshot block holding this kind.
    pub fn block(self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::Pet => "pets",
            EntityKind::Appointment => "appointments",
            EntityKind::Transaction => "transactions",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.block())
    }
}

/// Collections a caller can select for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Clients,
    Pets,
    Appointments,
    Transactions,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Clients,
        Collection::Pets,
        Collection::Appointments,
        Collection::Transactions,
    ];

    /// Parse a collection name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "clients" => Some(Collection::Clients),
            "pets" => Some(Collection::Pets),
            "appointments" => Some(Collection::Appointments),
            "transactions" => Some(Collection::Transactions),
            _ => None,
        }
    }

    pub fn kind(self) -> EntityKind {
        match self {
            Collection::Clients => EntityKind::Client,
            Collection::Pets => EntityKind::Pet,
            Collection::Appointments => EntityKind::Appointment,
            Collection::Transactions => EntityKind::Transaction,
        }
    }
}

/// Allow-listed core fields of a post-backed entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPost {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub modified: String,
}

/// One client, pet or appointment inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Id on the source installation; only meaningful inside the snapshot.
    pub id: i64,
    pub post: EntityPost,
    #[serde(default, deserialize_with = "deserialize_meta")]
    pub meta: Meta,
}

/// One row of the financial transactions table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub cliente_id: Option<i64>,
    #[serde(default)]
    pub agendamento_id: Option<i64>,
    #[serde(default)]
    pub plano_id: Option<i64>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub valor: f64,
    #[serde(default)]
    pub categoria: String,
    #[serde(default)]
    pub tipo: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub descricao: String,
}

/// A single cell of an auxiliary table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// Binary cell, written as `{"$base64": "..."}`.
    Blob {
        #[serde(rename = "$base64")]
        base64: String,
    },
}

pub type TableRow = BTreeMap<String, CellValue>;

/// Structured description of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub sql_type: String,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// 1-based position inside the primary key, 0 when not part of it.
    #[serde(default)]
    pub primary_key: u32,
}

/// An application-owned table captured generically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryTable {
    /// Portable name, without the installation prefix (e.g. `petstash_loyalty`).
    pub name: String,
    /// Raw creation DDL with the installation prefix replaced by a placeholder.
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

/// Entity binding of an attachment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentBinding {
    /// Attachment id on the source installation.
    pub id: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub parent_kind: Option<EntityKind>,
    #[serde(default)]
    pub post: EntityPost,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, deserialize_with = "deserialize_meta")]
    pub meta: Meta,
}

/// A file from the upload area, base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobFile {
    /// Path relative to the upload root.
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentBinding>,
}

/// The root snapshot document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub plugin: String,
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub clients: Vec<EntityRecord>,
    pub pets: Vec<EntityRecord>,
    pub appointments: Vec<EntityRecord>,
    pub transactions: Vec<TransactionRecord>,
    #[serde(default)]
    pub tables: Vec<AuxiliaryTable>,
    #[serde(default)]
    pub files: Vec<BlobFile>,
}

impl Snapshot {
    /// Empty snapshot stamped with this engine's identity and version.
    pub fn empty() -> Self {
        Self {
            plugin: PLUGIN_ID.to_string(),
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            clients: Vec::new(),
            pets: Vec::new(),
            appointments: Vec::new(),
            transactions: Vec::new(),
            tables: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn entities(&self, kind: EntityKind) -> &[EntityRecord] {
        match kind {
            EntityKind::Client => &self.clients,
            EntityKind::Pet => &self.pets,
            EntityKind::Appointment => &self.appointments,
            EntityKind::Transaction => &[],
        }
    }

    pub(crate) fn entities_mut(&mut self, kind: EntityKind) -> Option<&mut Vec<EntityRecord>> {
        match kind {
            EntityKind::Client => Some(&mut self.clients),
            EntityKind::Pet => Some(&mut self.pets),
            EntityKind::Appointment => Some(&mut self.appointments),
            EntityKind::Transaction => None,
        }
    }
}

/// Per-collection totals, shared by the UI summary and the diff reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCounts {
    pub clients: usize,
    pub pets: usize,
    pub appointments: usize,
    pub transactions: usize,
    pub tables: usize,
    pub files: usize,
}

impl ComponentCounts {
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            clients: snapshot.clients.len(),
            pets: snapshot.pets.len(),
            appointments: snapshot.appointments.len(),
            transactions: snapshot.transactions.len(),
            tables: snapshot.tables.len(),
            files: snapshot.files.len(),
        }
    }

    /// `(label, count)` pairs in display order.
    pub fn entries(&self) -> [(&'static str, usize); 6] {
        [
            ("clients", self.clients),
            ("pets", self.pets),
            ("appointments", self.appointments),
            ("transactions", self.transactions),
            ("tables", self.tables),
            ("files", self.files),
        ]
    }
}

/// Summary attached to every generated backup for the history ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStats {
    pub generated_at: DateTime<Utc>,
    pub collections: Vec<String>,
    pub counts: ComponentCounts,
    /// Total rows across captured auxiliary tables.
    pub table_rows: usize,
    /// Decoded bytes across captured files.
    pub file_bytes: u64,
    /// SHA-256 of the stored archive, filled in once written.
    #[serde(default)]
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_parse_ignores_unknown() {
        assert_eq!(Collection::parse("Pets"), Some(Collection::Pets));
        assert_eq!(Collection::parse(" clients "), Some(Collection::Clients));
        assert_eq!(Collection::parse("invoices"), None);
    }

    #[test]
    fn test_snapshot_json_layout() {
        let snapshot = Snapshot::empty();
        let json = serde_json::to_value(&snapshot).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();

        for key in [
            "plugin",
            "schema_version",
            "generated_at",
            "clients",
            "pets",
            "appointments",
            "transactions",
            "tables",
            "files",
        ] {
            assert!(keys.contains(&key), "missing {key}");
        }
        assert_eq!(json["plugin"], "petstash");
        assert_eq!(json["schema_version"], 1);
    }

    #[test]
    fn test_cell_values_keep_sql_types() {
        let row: TableRow =
            serde_json::from_str(r#"{"id": 3, "points": 1.5, "note": "vip", "gone": null}"#)
                .unwrap();
        assert_eq!(row["id"], CellValue::Integer(3));
        assert_eq!(row["points"], CellValue::Real(1.5));
        assert_eq!(row["note"], CellValue::Text("vip".into()));
        assert_eq!(row["gone"], CellValue::Null);
    }

    #[test]
    fn test_blob_cells_are_tagged() {
        let row: TableRow = serde_json::from_str(r#"{"raw": {"$base64": "AP8Q"}, "text": "AP8Q"}"#).unwrap();
        assert_eq!(
            row["raw"],
            CellValue::Blob {
                base64: "AP8Q".into()
            }
        );
        assert_eq!(row["text"], CellValue::Text("AP8Q".into()));
        assert_eq!(
            serde_json::to_value(&row["raw"]).unwrap(),
            serde_json::json!({"$base64": "AP8Q"})
        );
    }

    #[test]
    fn test_entity_record_meta_optional() {
        let record: EntityRecord =
            serde_json::from_str(r#"{"id": 1, "post": {"title": "Ana"}}"#).unwrap();
        assert_eq!(record.post.title, "Ana");
        assert!(record.meta.is_empty());
    }
}
