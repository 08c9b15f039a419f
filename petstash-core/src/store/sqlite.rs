/*!
SQLite adapter for the storage ports.
*/

use base64::{engine::general_purpose, Engine as _};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::{EntityStore, NewPost, PostRow, SqlExecutor, StoredPost, ATTACHMENT_POST_TYPE};
use crate::model::{CellValue, ColumnDef, EntityKind, TableRow, TransactionRecord};
use crate::{PetstashError, Result};

/// Table name suffix of the transactions table.
pub const TRANSACTIONS_TABLE: &str = "petstash_transactions";

const POST_COLUMNS: &str = "id, post_type, post_title, post_content, post_excerpt, post_status, \
                            post_date, post_modified, post_parent, post_mime_type";

// SQLite's default host parameter limit is 999 on older builds.
const MAX_BOUND_IDS: usize = 500;

/// [`EntityStore`] backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Connection,
    prefix: String,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the host tables exist.
    pub fn open<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening database at {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PetstashError::storage(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        Self::with_connection(Connection::open(path)?, prefix)
    }

    /// Private in-memory database, mostly for tests and dry runs.
    pub fn open_in_memory(prefix: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, prefix)
    }

    fn with_connection(conn: Connection, prefix: &str) -> Result<Self> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PetstashError::config(format!(
                "table prefix '{prefix}' may only contain letters, digits and underscores"
            )));
        }

        let store = Self {
            conn,
            prefix: prefix.to_string(),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    fn posts(&self) -> String {
        quote_ident(&format!("{}posts", self.prefix))
    }

    fn postmeta(&self) -> String {
        quote_ident(&format!("{}postmeta", self.prefix))
    }

    fn initialize_tables(&self) -> Result<()> {
        let p = &self.prefix;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{p}posts" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_type TEXT NOT NULL,
                post_title TEXT NOT NULL DEFAULT '',
                post_content TEXT NOT NULL DEFAULT '',
                post_excerpt TEXT NOT NULL DEFAULT '',
                post_status TEXT NOT NULL DEFAULT 'publish',
                post_date TEXT NOT NULL DEFAULT '',
                post_modified TEXT NOT NULL DEFAULT '',
                post_parent INTEGER NOT NULL DEFAULT 0,
                post_mime_type TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS "{p}idx_posts_type" ON "{p}posts"(post_type);
            CREATE INDEX IF NOT EXISTS "{p}idx_posts_parent" ON "{p}posts"(post_parent);

            CREATE TABLE IF NOT EXISTS "{p}postmeta" (
                meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                meta_key TEXT NOT NULL,
                meta_value TEXT
            );
            CREATE INDEX IF NOT EXISTS "{p}idx_postmeta_post" ON "{p}postmeta"(post_id, meta_key);

            CREATE TABLE IF NOT EXISTS "{p}{TRANSACTIONS_TABLE}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cliente_id INTEGER,
                agendamento_id INTEGER,
                plano_id INTEGER,
                data TEXT,
                valor REAL NOT NULL DEFAULT 0,
                categoria TEXT NOT NULL DEFAULT '',
                tipo TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'em_aberto',
                descricao TEXT NOT NULL DEFAULT ''
            );
            "#
        );
        self.conn.execute_batch(&ddl)?;
        debug!("Host tables ready for prefix '{}'", self.prefix);
        Ok(())
    }

    fn query_posts(&self, where_clause: &str, args: Vec<Value>) -> Result<Vec<PostRow>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM {} WHERE {where_clause} ORDER BY id",
            self.posts()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(PostRow {
                id: row.get(0)?,
                post_type: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                excerpt: row.get(4)?,
                status: row.get(5)?,
                date: row.get(6)?,
                modified: row.get(7)?,
                parent: row.get(8)?,
                mime_type: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Attach metadata rows to already loaded posts.
    fn with_meta(&self, posts: Vec<PostRow>) -> Result<Vec<StoredPost>> {
        let mut meta: BTreeMap<i64, Vec<(String, String)>> = BTreeMap::new();
        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();

        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let sql = format!(
                "SELECT post_id, meta_key, meta_value FROM {} WHERE post_id IN ({}) ORDER BY meta_id",
                self.postmeta(),
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                ))
            })?;
            for row in rows {
                let (post_id, key, value) = row?;
                meta.entry(post_id).or_default().push((key, value));
            }
        }

        Ok(posts
            .into_iter()
            .map(|post| {
                let meta = meta.remove(&post.id).unwrap_or_default();
                StoredPost { post, meta }
            })
            .collect())
    }
}

impl SqlExecutor for SqliteStore {
    fn table_prefix(&self) -> &str {
        &self.prefix
    }

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND substr(name, 1, length(?1)) = ?1
             ORDER BY name",
        )?;
        let names = stmt.query_map([prefix], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn table_ddl(&self, name: &str) -> Result<Option<String>> {
        let ddl = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(ddl.flatten())
    }

    fn table_columns(&self, name: &str) -> Result<Vec<ColumnDef>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt.query_map([name], |row| {
            Ok(ColumnDef {
                name: row.get(0)?,
                sql_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                default: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? as u32,
            })
        })?;
        Ok(columns.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn index_ddls(&self, name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
             ORDER BY name",
        )?;
        let ddls = stmt.query_map([name], |row| row.get::<_, String>(0))?;
        Ok(ddls.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.conn.execute(sql, [])?;
        Ok(())
    }

    fn fetch_rows(&self, name: &str) -> Result<Vec<TableRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(name)))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = TableRow::new();
            for (index, column) in columns.iter().enumerate() {
                let cell = match row.get::<_, Value>(index)? {
                    Value::Null => CellValue::Null,
                    Value::Integer(i) => CellValue::Integer(i),
                    Value::Real(f) => CellValue::Real(f),
                    Value::Text(s) => CellValue::Text(s),
                    Value::Blob(bytes) => CellValue::Blob {
                        base64: general_purpose::STANDARD.encode(bytes),
                    },
                };
                record.insert(column.clone(), cell);
            }
            out.push(record);
        }
        Ok(out)
    }

    fn insert_row(&self, name: &str, row: &TableRow) -> Result<()> {
        if row.is_empty() {
            self.conn.execute(
                &format!("INSERT INTO {} DEFAULT VALUES", quote_ident(name)),
                [],
            )?;
            return Ok(());
        }

        let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
        let mut values = Vec::with_capacity(row.len());
        for cell in row.values() {
            values.push(match cell {
                CellValue::Null => Value::Null,
                CellValue::Integer(i) => Value::Integer(*i),
                CellValue::Real(f) => Value::Real(*f),
                CellValue::Text(s) => Value::Text(s.clone()),
                CellValue::Blob { base64 } => Value::Blob(general_purpose::STANDARD.decode(base64)?),
            });
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns.join(", "),
            placeholders(values.len())
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn truncate(&self, name: &str) -> Result<()> {
        self.conn
            .execute(&format!("DELETE FROM {}", quote_ident(name)), [])?;
        if self.table_exists("sqlite_sequence")? {
            self.conn
                .execute("DELETE FROM sqlite_sequence WHERE name = ?1", [name])?;
        }
        Ok(())
    }
}

impl EntityStore for SqliteStore {
    fn list_entities(&self, kind: EntityKind) -> Result<Vec<StoredPost>> {
        let Some(post_type) = kind.post_type() else {
            return Ok(Vec::new());
        };
        let posts = self.query_posts("post_type = ?1", vec![Value::Text(post_type.into())])?;
        self.with_meta(posts)
    }

    fn count_entities(&self, kind: EntityKind) -> Result<usize> {
        let Some(post_type) = kind.post_type() else {
            return self.count_transactions();
        };
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE post_type = ?1", self.posts()),
            [post_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn post_ids_by_type_prefix(&self, type_prefix: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE substr(post_type, 1, length(?1)) = ?1 ORDER BY id",
            self.posts()
        ))?;
        let ids = stmt.query_map([type_prefix], |row| row.get::<_, i64>(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_post(&self, id: i64) -> Result<Option<StoredPost>> {
        let posts = self.query_posts("id = ?1", vec![Value::Integer(id)])?;
        Ok(self.with_meta(posts)?.into_iter().next())
    }

    fn attachments_of(&self, parent_ids: &[i64]) -> Result<Vec<StoredPost>> {
        let mut posts = Vec::new();
        for chunk in parent_ids.chunks(MAX_BOUND_IDS) {
            let mut args = vec![Value::Text(ATTACHMENT_POST_TYPE.into())];
            args.extend(chunk.iter().map(|id| Value::Integer(*id)));
            let where_clause = format!(
                "post_type = ?1 AND post_parent IN ({})",
                (2..=chunk.len() + 1)
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            posts.extend(self.query_posts(&where_clause, args)?);
        }
        posts.sort_by_key(|p| p.id);
        self.with_meta(posts)
    }

    fn meta_values(&self, post_ids: &[i64], key: &str) -> Result<Vec<String>> {
        let mut values = Vec::new();
        for chunk in post_ids.chunks(MAX_BOUND_IDS) {
            let sql = format!(
                "SELECT meta_value FROM {} WHERE meta_key = ?1 AND post_id IN ({}) ORDER BY meta_id",
                self.postmeta(),
                (2..=chunk.len() + 1)
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut args = vec![Value::Text(key.into())];
            args.extend(chunk.iter().map(|id| Value::Integer(*id)));

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                row.get::<_, Option<String>>(0)
            })?;
            for value in rows {
                if let Some(value) = value? {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    fn insert_post(&self, post: &NewPost) -> Result<i64> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (post_type, post_title, post_content, post_excerpt, post_status,
                                 post_date, post_modified, post_parent, post_mime_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.posts()
            ),
            params![
                post.post_type,
                post.title,
                post.content,
                post.excerpt,
                post.status,
                post.date,
                post.modified,
                post.parent,
                post.mime_type,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_meta(&self, post_id: i64, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                self.postmeta()
            ),
            params![post_id, key, value],
        )?;
        Ok(())
    }

    fn update_meta(&self, post_id: i64, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE post_id = ?1 AND meta_key = ?2",
                self.postmeta()
            ),
            params![post_id, key],
        )?;
        self.add_meta(post_id, key, value)
    }

    fn delete_posts(&self, ids: &[i64]) -> Result<usize> {
        let mut deleted = 0;
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let marks = placeholders(chunk.len());
            self.conn.execute(
                &format!("DELETE FROM {} WHERE post_id IN ({marks})", self.postmeta()),
                params_from_iter(chunk.iter()),
            )?;
            deleted += self.conn.execute(
                &format!("DELETE FROM {} WHERE id IN ({marks})", self.posts()),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(deleted)
    }

    fn transactions_table(&self) -> String {
        format!("{}{}", self.prefix, TRANSACTIONS_TABLE)
    }

    fn list_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, cliente_id, agendamento_id, plano_id, data, valor, categoria, tipo, status, descricao
             FROM {} ORDER BY id",
            quote_ident(&self.transactions_table())
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(TransactionRecord {
                id: row.get(0)?,
                cliente_id: row.get(1)?,
                agendamento_id: row.get(2)?,
                plano_id: row.get(3)?,
                data: row.get(4)?,
                valor: row.get(5)?,
                categoria: row.get(6)?,
                tipo: row.get(7)?,
                status: row.get(8)?,
                descricao: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn count_transactions(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}",
                quote_ident(&self.transactions_table())
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_transaction(&self, record: &TransactionRecord) -> Result<i64> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (cliente_id, agendamento_id, plano_id, data, valor, categoria, tipo, status, descricao)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                quote_ident(&self.transactions_table())
            ),
            params![
                record.cliente_id,
                record.agendamento_id,
                record.plano_id,
                record.data,
                record.valor,
                record.categoria,
                record.tipo,
                record.status,
                record.descricao,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
