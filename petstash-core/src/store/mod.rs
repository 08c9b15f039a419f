/*!
Storage ports for the live dataset.

The engine never reaches a database handle directly: the exporter, the table
reflector and the restore engine receive an implementation of these traits.
[`SqliteStore`] is the bundled adapter.
*/

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::model::{ColumnDef, EntityKind, TableRow, TransactionRecord};
use crate::Result;

/// Post type used for attachment rows.
pub const ATTACHMENT_POST_TYPE: &str = "attachment";

/// Metadata key holding an attachment's path relative to the upload root.
pub const ATTACHED_FILE_KEY: &str = "_attached_file";

/// A row of the posts table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostRow {
    pub id: i64,
    pub post_type: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub status: String,
    pub date: String,
    pub modified: String,
    pub parent: i64,
    pub mime_type: String,
}

/// A post together with its raw (still serialized) metadata rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredPost {
    pub post: PostRow,
    pub meta: Vec<(String, String)>,
}

impl StoredPost {
    /// First stored value for `key`.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Insert request for the posts table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPost {
    pub post_type: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub status: String,
    pub date: String,
    pub modified: String,
    pub parent: i64,
    pub mime_type: String,
}

/// Generic SQL execution port.
///
/// Used by the auxiliary table reflector, which handles tables whose schema
/// is only known at runtime, and by the restore engine for its unit of work.
pub trait SqlExecutor {
    /// Installation specific table prefix (e.g. `wp_`).
    fn table_prefix(&self) -> &str;

    /// Open the unit of work. Implementations must take a write lock.
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Names of all tables starting with `prefix`, sorted.
    fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;

    fn table_exists(&self, name: &str) -> Result<bool>;

    /// Creation DDL as recorded by the database.
    fn table_ddl(&self, name: &str) -> Result<Option<String>>;

    fn table_columns(&self, name: &str) -> Result<Vec<ColumnDef>>;

    /// Creation DDL of explicit indexes on the table.
    fn index_ddls(&self, name: &str) -> Result<Vec<String>>;

    /// Execute a single statement.
    fn execute(&self, sql: &str) -> Result<()>;

    fn fetch_rows(&self, name: &str) -> Result<Vec<TableRow>>;

    fn insert_row(&self, name: &str, row: &TableRow) -> Result<()>;

    /// Remove every row of a table.
    fn truncate(&self, name: &str) -> Result<()>;
}

/// Typed access to the business entities.
pub trait EntityStore: SqlExecutor {
    /// Every entity of a post-backed kind, with metadata, ordered by id.
    fn list_entities(&self, kind: EntityKind) -> Result<Vec<StoredPost>>;

    fn count_entities(&self, kind: EntityKind) -> Result<usize>;

    /// Ids of every post whose type starts with `type_prefix`.
    fn post_ids_by_type_prefix(&self, type_prefix: &str) -> Result<Vec<i64>>;

    fn load_post(&self, id: i64) -> Result<Option<StoredPost>>;

    /// Attachments whose parent is one of `parent_ids`.
    fn attachments_of(&self, parent_ids: &[i64]) -> Result<Vec<StoredPost>>;

    /// Raw values stored under `key` for any of the given posts.
    fn meta_values(&self, post_ids: &[i64], key: &str) -> Result<Vec<String>>;

    fn insert_post(&self, post: &NewPost) -> Result<i64>;

    fn add_meta(&self, post_id: i64, key: &str, value: &str) -> Result<()>;

    /// Replace every value of `key` on a post.
    fn update_meta(&self, post_id: i64, key: &str, value: &str) -> Result<()>;

    /// Delete posts and all of their metadata.
    fn delete_posts(&self, ids: &[i64]) -> Result<usize>;

    /// Live name of the transactions table.
    fn transactions_table(&self) -> String;

    fn list_transactions(&self) -> Result<Vec<TransactionRecord>>;

    fn count_transactions(&self) -> Result<usize>;

    fn insert_transaction(&self, record: &TransactionRecord) -> Result<i64>;
}
