//! System catalog: the persistent directory of databases, tables and their
//! schemas.
//!
//! The whole catalog serializes to one JSON file under the data directory.
//! Every DDL mutation saves immediately; the save writes a sibling
//! `catalog.json.tmp` and renames it over the target so a crash never
//! leaves a half-written catalog. A missing file is not an error; the
//! catalog starts empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, Result};

/// Catalog file name under the data directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// Column data types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    Varchar(usize),
    Text,
}

/// Column definition with constraint hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub not_null: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            primary_key: false,
            unique: false,
            not_null: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// True when the column should be backed by a unique index.
    pub fn is_indexed(&self) -> bool {
        self.primary_key || self.unique
    }
}

/// One table's catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<Column>,
    /// Path of the table's heap file, relative to the data directory.
    pub heap_file: String,
    pub created_at: DateTime<Utc>,
}

impl TableMeta {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One database's catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub tables: HashMap<String, TableMeta>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogData {
    databases: HashMap<String, DatabaseMeta>,
}

/// Thread-safe persistent catalog.
pub struct Catalog {
    path: PathBuf,
    inner: RwLock<CatalogData>,
}

impl Catalog {
    /// Loads the catalog from `<data_dir>/catalog.json`, starting empty if
    /// the file does not exist.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join(CATALOG_FILE);
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogData::default(),
            Err(e) => return Err(DbError::Io(e)),
        };
        debug!(path = %path.display(), databases = data.databases.len(), "opened catalog");
        Ok(Self {
            path,
            inner: RwLock::new(data),
        })
    }

    /// Registers a new database and persists.
    pub fn create_database(&self, name: &str) -> Result<()> {
        {
            let mut data = self.inner.write();
            if data.databases.contains_key(name) {
                return Err(DbError::already_exists("database", name));
            }
            data.databases.insert(
                name.to_string(),
                DatabaseMeta {
                    name: name.to_string(),
                    tables: HashMap::new(),
                },
            );
        }
        self.save()
    }

    /// Removes a database and persists; returns its entry so the caller
    /// can clean up the files it pointed at.
    pub fn drop_database(&self, name: &str) -> Result<DatabaseMeta> {
        let meta = {
            let mut data = self.inner.write();
            data.databases
                .remove(name)
                .ok_or_else(|| DbError::not_found("database", name))?
        };
        self.save()?;
        Ok(meta)
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.inner.read().databases.contains_key(name)
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a table under a database and persists.
    pub fn create_table(&self, database: &str, table: TableMeta) -> Result<()> {
        {
            let mut data = self.inner.write();
            let db = data
                .databases
                .get_mut(database)
                .ok_or_else(|| DbError::not_found("database", database))?;
            if db.tables.contains_key(&table.name) {
                return Err(DbError::already_exists("table", &table.name));
            }
            db.tables.insert(table.name.clone(), table);
        }
        self.save()
    }

    /// Removes a table and persists; returns its entry.
    pub fn drop_table(&self, database: &str, table: &str) -> Result<TableMeta> {
        let meta = {
            let mut data = self.inner.write();
            let db = data
                .databases
                .get_mut(database)
                .ok_or_else(|| DbError::not_found("database", database))?;
            db.tables
                .remove(table)
                .ok_or_else(|| DbError::not_found("table", table))?
        };
        self.save()?;
        Ok(meta)
    }

    /// Appends a column to a table (renames are forbidden; this is the only
    /// supported ALTER) and persists.
    pub fn add_column(&self, database: &str, table: &str, column: Column) -> Result<()> {
        {
            let mut data = self.inner.write();
            let db = data
                .databases
                .get_mut(database)
                .ok_or_else(|| DbError::not_found("database", database))?;
            let meta = db
                .tables
                .get_mut(table)
                .ok_or_else(|| DbError::not_found("table", table))?;
            if meta.column(&column.name).is_some() {
                return Err(DbError::already_exists("column", &column.name));
            }
            meta.columns.push(column);
        }
        self.save()
    }

    pub fn get_table(&self, database: &str, table: &str) -> Result<TableMeta> {
        self.inner
            .read()
            .databases
            .get(database)
            .ok_or_else(|| DbError::not_found("database", database))?
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::not_found("table", table))
    }

    pub fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let data = self.inner.read();
        let db = data
            .databases
            .get(database)
            .ok_or_else(|| DbError::not_found("database", database))?;
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Writes the catalog atomically: serialize a snapshot under the read
    /// lock, write `*.tmp`, rename over the target.
    pub fn save(&self) -> Result<()> {
        let json = {
            let data = self.inner.read();
            serde_json::to_vec_pretty(&*data)?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
