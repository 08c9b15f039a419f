/*!
Snapshot validator.

Inbound documents are untrusted. Rules run in a fixed order and the first
failure is returned; nothing is ever mutated here.
*/

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{Snapshot, PLUGIN_ID, SCHEMA_VERSION};

type Validated<T> = std::result::Result<T, ValidationError>;

/// Blocks that must be present and list-shaped.
const REQUIRED_BLOCKS: [&str; 4] = ["clients", "pets", "appointments", "transactions"];

/// Blocks holding post-backed entity records.
const ENTITY_BLOCKS: [&str; 3] = ["clients", "pets", "appointments"];

/// Blocks that may be omitted but must be lists when present.
const OPTIONAL_BLOCKS: [&str; 2] = ["tables", "files"];

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotValidator;

impl SnapshotValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate raw JSON bytes (already decompressed).
    pub fn validate_bytes(&self, bytes: &[u8]) -> Validated<Snapshot> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidationError::NotJson(e.to_string()))?;
        self.validate_value(value)
    }

    /// Validate a parsed document and convert it into a trusted [`Snapshot`].
    pub fn validate_value(&self, value: Value) -> Validated<Snapshot> {
        let root = value.as_object().ok_or(ValidationError::NotAnObject)?;

        check_plugin(root)?;
        check_schema_version(root)?;

        for block in REQUIRED_BLOCKS {
            match root.get(block) {
                None => return Err(ValidationError::MissingBlock { block }),
                Some(Value::Array(_)) => {}
                Some(_) => return Err(ValidationError::BlockNotList { block }),
            }
        }

        for block in ENTITY_BLOCKS {
            if let Some(Value::Array(entries)) = root.get(block) {
                for (index, entry) in entries.iter().enumerate() {
                    check_entity(block, index, entry)?;
                }
            }
        }

        for block in OPTIONAL_BLOCKS {
            match root.get(block) {
                None | Some(Value::Array(_)) => {}
                Some(_) => return Err(ValidationError::BlockNotList { block }),
            }
        }

        let snapshot: Snapshot =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        debug!(
            "Validated snapshot generated at {} ({} clients, {} pets, {} appointments)",
            snapshot.generated_at,
            snapshot.clients.len(),
            snapshot.pets.len(),
            snapshot.appointments.len()
        );
        Ok(snapshot)
    }
}

fn check_plugin(root: &Map<String, Value>) -> Validated<()> {
    match root.get("plugin") {
        Some(Value::String(tag)) if tag == PLUGIN_ID => Ok(()),
        Some(Value::String(tag)) => Err(ValidationError::ForeignPlugin {
            found: Some(tag.clone()),
        }),
        _ => Err(ValidationError::ForeignPlugin { found: None }),
    }
}

fn check_schema_version(root: &Map<String, Value>) -> Validated<()> {
    match root.get("schema_version") {
        None | Some(Value::Null) => Err(ValidationError::MissingSchemaVersion),
        Some(Value::Number(n)) if n.as_u64() == Some(u64::from(SCHEMA_VERSION)) => Ok(()),
        Some(other) => Err(ValidationError::UnsupportedSchemaVersion {
            found: other.to_string(),
            supported: SCHEMA_VERSION,
        }),
    }
}

fn check_entity(block: &'static str, index: usize, entry: &Value) -> Validated<()> {
    let entry = entry
        .as_object()
        .ok_or(ValidationError::EntryNotObject { block, index })?;

    if !matches!(entry.get("post"), Some(Value::Object(_))) {
        return Err(ValidationError::InvalidPost { block, index });
    }

    match entry.get("meta") {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(ValidationError::InvalidMeta { block, index }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "plugin": "petstash",
            "schema_version": 1,
            "generated_at": "2024-03-01T10:00:00Z",
            "clients": [{"id": 1, "post": {"title": "Ana"}, "meta": {"client_phone": "555"}}],
            "pets": [{"id": 5, "post": {"title": "Rex"}, "meta": {"owner_id": "1"}}],
            "appointments": [],
            "transactions": [{"cliente_id": 1, "valor": 80.0, "status": "pago"}],
            "tables": [],
            "files": []
        })
    }

    fn validate(value: Value) -> Validated<Snapshot> {
        SnapshotValidator::new().validate_value(value)
    }

    #[test]
    fn test_accepts_well_formed_document() {
        let snapshot = validate(document()).unwrap();
        assert_eq!(snapshot.clients[0].post.title, "Ana");
        assert_eq!(snapshot.transactions[0].cliente_id, Some(1));
    }

    #[test]
    fn test_rejects_non_json_and_non_objects() {
        let validator = SnapshotValidator::new();
        assert!(matches!(
            validator.validate_bytes(b"not json"),
            Err(ValidationError::NotJson(_))
        ));
        assert_eq!(validate(json!([1, 2])), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn test_plugin_checked_before_version() {
        let mut doc = document();
        doc["plugin"] = json!("vetcare");
        doc["schema_version"] = json!(2);
        assert_eq!(
            validate(doc),
            Err(ValidationError::ForeignPlugin {
                found: Some("vetcare".into())
            })
        );
    }

    #[test]
    fn test_schema_version_gate() {
        let mut doc = document();
        doc["schema_version"] = json!(2);
        assert!(matches!(
            validate(doc),
            Err(ValidationError::UnsupportedSchemaVersion { supported: 1, .. })
        ));

        let mut doc = document();
        doc.as_object_mut().unwrap().remove("schema_version");
        assert_eq!(validate(doc), Err(ValidationError::MissingSchemaVersion));

        let mut doc = document();
        doc["schema_version"] = json!("1");
        assert!(validate(doc).is_err());
    }

    #[test]
    fn test_required_blocks_must_be_lists() {
        let mut doc = document();
        doc.as_object_mut().unwrap().remove("appointments");
        assert_eq!(
            validate(doc),
            Err(ValidationError::MissingBlock {
                block: "appointments"
            })
        );

        let mut doc = document();
        doc["transactions"] = json!({"0": {}});
        assert_eq!(
            validate(doc),
            Err(ValidationError::BlockNotList {
                block: "transactions"
            })
        );

        let mut doc = document();
        doc["files"] = json!("none");
        assert_eq!(validate(doc), Err(ValidationError::BlockNotList { block: "files" }));
    }

    #[test]
    fn test_entity_shape_names_block_and_index() {
        let mut doc = document();
        doc["pets"] = json!([{"id": 5, "post": {}}, {"id": 6, "post": "Rex"}]);
        assert_eq!(
            validate(doc),
            Err(ValidationError::InvalidPost {
                block: "pets",
                index: 1
            })
        );

        let mut doc = document();
        doc["clients"][0]["meta"] = json!("phone=555");
        assert_eq!(
            validate(doc),
            Err(ValidationError::InvalidMeta {
                block: "clients",
                index: 0
            })
        );

        let mut doc = document();
        doc["appointments"] = json!([42]);
        assert_eq!(
            validate(doc),
            Err(ValidationError::EntryNotObject {
                block: "appointments",
                index: 0
            })
        );
    }

    #[test]
    fn test_typed_conversion_failures_are_malformed() {
        let mut doc = document();
        doc["clients"][0].as_object_mut().unwrap().remove("id");
        assert!(matches!(validate(doc), Err(ValidationError::Malformed(_))));
    }
}
