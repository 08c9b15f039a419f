/*!
Auxiliary table reflector.

Discovers application-owned tables by name, captures their schema and rows,
and recreates them on another installation. Every destructive routine here
checks the reserved `petstash_` prefix first.
*/

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::model::{AuxiliaryTable, ColumnDef};
use crate::store::sqlite::{quote_ident, TRANSACTIONS_TABLE};
use crate::store::SqlExecutor;
use crate::{PetstashError, Result};

/// Reserved name prefix of application-owned tables, after the installation prefix.
pub const OWNED_TABLE_PREFIX: &str = "petstash_";

/// Token standing in for the installation prefix inside captured DDL.
pub const TABLE_PREFIX_PLACEHOLDER: &str = "{{table_prefix}}";

/// True for portable names this engine may recreate or truncate.
///
/// The transactions table is owned but restored through its typed path.
pub fn is_owned_table(portable_name: &str) -> bool {
    owned_name_regex().is_match(portable_name) && portable_name != TRANSACTIONS_TABLE
}

/// Captures and recreates auxiliary tables through a [`SqlExecutor`].
pub struct TableReflector<'a, S: SqlExecutor + ?Sized> {
    store: &'a S,
}

impl<'a, S: SqlExecutor + ?Sized> TableReflector<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    fn live_name(&self, portable_name: &str) -> String {
        format!("{}{}", self.store.table_prefix(), portable_name)
    }

    fn normalize(&self, ddl: &str) -> String {
        ddl.replace(
            &self.live_name(OWNED_TABLE_PREFIX),
            &format!("{TABLE_PREFIX_PLACEHOLDER}{OWNED_TABLE_PREFIX}"),
        )
    }

    fn localize(&self, ddl: &str) -> String {
        ddl.replace(TABLE_PREFIX_PLACEHOLDER, self.store.table_prefix())
    }

    /// Portable names of the owned auxiliary tables currently present.
    pub fn owned_tables(&self) -> Result<Vec<String>> {
        let prefix = self.store.table_prefix();
        Ok(self
            .store
            .list_tables(&self.live_name(OWNED_TABLE_PREFIX))?
            .into_iter()
            .filter_map(|name| name.strip_prefix(prefix).map(str::to_string))
            .filter(|name| is_owned_table(name))
            .collect())
    }

    /// Snapshot every owned auxiliary table.
    pub fn capture(&self) -> Result<Vec<AuxiliaryTable>> {
        let mut tables = Vec::new();
        for name in self.owned_tables()? {
            let live = self.live_name(&name);
            let schema = self
                .store
                .table_ddl(&live)?
                .map(|ddl| self.normalize(&ddl))
                .unwrap_or_default();
            let indexes = self
                .store
                .index_ddls(&live)?
                .iter()
                .map(|ddl| self.normalize(ddl))
                .collect();
            let columns = self.store.table_columns(&live)?;
            let rows = self.store.fetch_rows(&live)?;

            debug!("Captured table {} ({} rows)", name, rows.len());
            tables.push(AuxiliaryTable {
                name,
                schema,
                columns,
                indexes,
                rows,
            });
        }
        info!("Captured {} auxiliary tables", tables.len());
        Ok(tables)
    }

    /// Remove every row of an owned table.
    pub fn truncate(&self, portable_name: &str) -> Result<()> {
        if !is_owned_table(portable_name) {
            return Err(PetstashError::TableNotOwned(portable_name.to_string()));
        }
        self.store.truncate(&self.live_name(portable_name))
    }

    /// Recreate (when missing), truncate and repopulate one table.
    ///
    /// Returns the number of inserted rows. Any failure is returned as is.
    pub fn recreate(&self, table: &AuxiliaryTable) -> Result<usize> {
        if !is_owned_table(&table.name) {
            return Err(PetstashError::TableNotOwned(table.name.clone()));
        }
        let live = self.live_name(&table.name);

        if !self.store.table_exists(&live)? {
            let ddl = self.create_ddl(table, &live)?;
            debug!("Creating table {}", live);
            self.store.execute(&ddl)?;

            for index in &table.indexes {
                let index = self.localize(index);
                check_index_statement(&table.name, &index, &live)?;
                self.store.execute(&index)?;
            }
        }

        self.store.truncate(&live)?;

        for row in &table.rows {
            if let Some(bad) = row.keys().find(|column| !identifier_regex().is_match(column)) {
                return Err(PetstashError::invalid_schema(
                    &table.name,
                    format!("invalid column name '{bad}' in row"),
                ));
            }
            self.store.insert_row(&live, row)?;
        }

        debug!("Restored table {} ({} rows)", live, table.rows.len());
        Ok(table.rows.len())
    }

    /// Structured columns drop constraints and expression defaults, so the
    /// captured schema wins whenever it carries any of them.
    fn create_ddl(&self, table: &AuxiliaryTable, live: &str) -> Result<String> {
        let has_schema = !table.schema.trim().is_empty();
        if table.columns.is_empty() || (has_schema && constraint_regex().is_match(&table.schema)) {
            return self.raw_create_statement(table, live);
        }
        match create_statement(live, &table.columns) {
            Ok(ddl) => Ok(ddl),
            Err(e) if has_schema => {
                debug!("Rebuilding {} from captured schema: {}", live, e);
                self.raw_create_statement(table, live)
            }
            Err(e) => Err(e),
        }
    }

    fn raw_create_statement(&self, table: &AuxiliaryTable, live: &str) -> Result<String> {
        if table.schema.trim().is_empty() {
            return Err(PetstashError::invalid_schema(
                &table.name,
                "neither columns nor a schema were captured",
            ));
        }
        let ddl = self.localize(&table.schema);
        let created = raw_create_regex()
            .captures(&ddl)
            .and_then(|caps| caps.get(3))
            .map(|m| m.as_str());

        if created != Some(live) || ddl.contains(';') {
            return Err(PetstashError::invalid_schema(
                &table.name,
                "schema must be a single CREATE TABLE statement for this table",
            ));
        }
        Ok(ddl)
    }
}

/// Build `CREATE TABLE` from structured columns after checking every piece.
pub fn create_statement(live_name: &str, columns: &[ColumnDef]) -> Result<String> {
    let mut primary: Vec<&ColumnDef> = columns.iter().filter(|c| c.primary_key > 0).collect();
    primary.sort_by_key(|c| c.primary_key);
    let inline_rowid = primary.len() == 1 && primary[0].sql_type.eq_ignore_ascii_case("INTEGER");

    let mut parts = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        if !identifier_regex().is_match(&column.name) {
            return Err(PetstashError::invalid_schema(
                live_name,
                format!("invalid column name '{}'", column.name),
            ));
        }
        let sql_type = column.sql_type.trim();
        if !sql_type.is_empty() && !type_regex().is_match(sql_type) {
            return Err(PetstashError::invalid_schema(
                live_name,
                format!("invalid type '{}' for column '{}'", sql_type, column.name),
            ));
        }

        let mut part = quote_ident(&column.name);
        if !sql_type.is_empty() {
            part.push(' ');
            part.push_str(sql_type);
        }
        if inline_rowid && column.primary_key > 0 {
            part.push_str(" PRIMARY KEY");
        }
        if column.not_null {
            part.push_str(" NOT NULL");
        }
        if let Some(default) = column.default.as_deref() {
            let default = default.trim();
            if !default_regex().is_match(default) {
                return Err(PetstashError::invalid_schema(
                    live_name,
                    format!("invalid default for column '{}'", column.name),
                ));
            }
            part.push_str(" DEFAULT ");
            part.push_str(default);
        }
        parts.push(part);
    }

    if !primary.is_empty() && !inline_rowid {
        let keys: Vec<String> = primary.iter().map(|c| quote_ident(&c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_ident(live_name),
        parts.join(", ")
    ))
}

fn check_index_statement(table: &str, ddl: &str, live: &str) -> Result<()> {
    let target = index_regex()
        .captures(ddl)
        .and_then(|caps| caps.get(4))
        .map(|m| m.as_str());
    if target != Some(live) || ddl.contains(';') {
        return Err(PetstashError::invalid_schema(
            table,
            "index must be a single CREATE INDEX statement on this table",
        ));
    }
    Ok(())
}

fn owned_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^petstash_[a-z0-9_]+$").expect("static regex"))
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static regex"))
}

fn type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z]+( [A-Za-z]+)*(\(\s*\d+\s*(,\s*\d+\s*)?\))?$").expect("static regex")
    })
}

fn default_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(NULL|CURRENT_TIMESTAMP|CURRENT_DATE|CURRENT_TIME|-?\d+(\.\d+)?|'([^']|'')*')$")
            .expect("static regex")
    })
}

fn constraint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(UNIQUE|CHECK|REFERENCES|FOREIGN|AUTOINCREMENT|COLLATE|GENERATED)\b")
            .expect("static regex")
    })
}

fn raw_create_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(["`]?)([A-Za-z0-9_]+)["`]?\s*\("#)
            .expect("static regex")
    })
}

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(IF\s+NOT\s+EXISTS\s+)?["`]?([A-Za-z0-9_]+)["`]?\s+ON\s+["`]?([A-Za-z0-9_]+)["`]?\s*\("#,
        )
        .expect("static regex")
    })
}
