//! Per-address object store.
//!
//! Every address gets its own sled database, named from a fixed hash of the
//! address; tables are sled trees inside it. sled holds an exclusive lock
//! on an open database, so this module caches one handle per database and
//! hands out clones. After a migration the cached handles are evicted and
//! the next `open` builds a fresh one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::types::{Result, VestibuleError};

/// Name sled gives the default tree; it is not a table
const DEFAULT_TREE: &[u8] = b"__sled__default";

/// Hex characters of the address hash used in database names
const DB_NAME_HASH_LEN: usize = 16;

/// Database name for an address: `wallet-<first 16 hex of SHA-256(address)>`
pub fn db_name(address: &str) -> String {
    let digest = hex::encode(Sha256::digest(address.as_bytes()));
    format!("wallet-{}", &digest[..DB_NAME_HASH_LEN])
}

/// Handle to one per-address database
#[derive(Clone)]
pub struct ObjectDb {
    name: String,
    db: sled::Db,
}

impl ObjectDb {
    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open (or create) a table
    pub fn table(&self, table: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(table.as_bytes())?)
    }

    /// Names of all tables
    pub fn tables(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| name.as_ref() != DEFAULT_TREE)
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            .collect()
    }

    /// Write a JSON record
    pub fn put_record<T: serde::Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        self.table(table)?
            .insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Read a JSON record
    pub fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.table(table)?.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                VestibuleError::Storage(format!("corrupt record {table}/{key}: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Number of records in a table
    pub fn count(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.len())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Directory of per-address databases
pub struct ObjectStore {
    root: PathBuf,
    handles: Mutex<HashMap<String, ObjectDb>>,
}

impl ObjectStore {
    /// Store rooted at `root`; databases are subdirectories
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a database exists on disk for `address`
    pub fn exists(&self, address: &str) -> bool {
        self.path_for(&db_name(address)).exists()
    }

    /// Open (or reuse) the database for `address`
    pub fn open(&self, address: &str) -> Result<ObjectDb> {
        let name = db_name(address);
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| VestibuleError::Internal("object store mutex poisoned".into()))?;

        if let Some(handle) = handles.get(&name) {
            return Ok(handle.clone());
        }

        let path = self.path_for(&name);
        let db = sled::open(&path)?;
        info!(path = %path.display(), "Opened object database");

        let handle = ObjectDb { name: name.clone(), db };
        handles.insert(name, handle.clone());
        Ok(handle)
    }

    /// Flush and forget the cached handle for `address`.
    ///
    /// Callers must drop their clones before reopening; sled keeps the
    /// database locked while any clone is alive.
    pub fn evict(&self, address: &str) -> Result<()> {
        let name = db_name(address);
        let removed = self
            .handles
            .lock()
            .map_err(|_| VestibuleError::Internal("object store mutex poisoned".into()))?
            .remove(&name);

        if let Some(handle) = removed {
            handle.flush()?;
            debug!(db = %name, "Evicted object database handle");
        }
        Ok(())
    }
}
