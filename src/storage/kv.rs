//! Namespaced key-value store.
//!
//! One sled tree holds every namespace. Wallet data lives under
//! `wallet/<address>/<key>`; one-time migration markers live under
//! `flags/<migration id>`. Values are JSON.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Result, VestibuleError};

/// Root of all wallet namespaces
const WALLET_ROOT: &str = "wallet/";

/// Root of migration flags
const FLAG_ROOT: &str = "flags/";

/// Key whose presence marks a populated namespace
pub const CANONICAL_KEY: &str = "identity";

/// Idempotency marker for a one-time destructive migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFlag {
    pub migration_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Flat namespaced key-value store
#[derive(Clone)]
pub struct KvStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl KvStore {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened key-value store");
        Self::with_db(db)
    }

    /// Use the `kv` tree of an already open database
    pub fn with_db(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree("kv")?;
        Ok(Self { db, tree })
    }

    /// Underlying database (shared with the approval journal)
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Prefix of the namespace for `address`
    pub fn prefix(address: &str) -> String {
        format!("{WALLET_ROOT}{address}/")
    }

    /// Namespace view for one address
    pub fn namespace(&self, address: &str) -> KvNamespace {
        KvNamespace {
            tree: self.tree.clone(),
            prefix: Self::prefix(address),
        }
    }

    /// Raw entries under a prefix, prefix included in the returned keys
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| VestibuleError::Storage(format!("non UTF-8 key: {e}")))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    /// Raw read
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Raw write (overwrites)
    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Whether a key exists
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    /// Read a migration flag
    pub fn flag(&self, migration_id: &str) -> Result<Option<MigrationFlag>> {
        match self.get_raw(&format!("{FLAG_ROOT}{migration_id}"))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                VestibuleError::Storage(format!("corrupt migration flag: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Record a migration as completed
    pub fn set_flag(&self, migration_id: &str) -> Result<MigrationFlag> {
        let flag = MigrationFlag {
            migration_id: migration_id.to_string(),
            completed_at: Utc::now(),
        };
        self.put_raw(&format!("{FLAG_ROOT}{migration_id}"), &serde_json::to_vec(&flag)?)?;
        Ok(flag)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// View of one address namespace
#[derive(Clone)]
pub struct KvNamespace {
    tree: sled::Tree,
    prefix: String,
}

impl KvNamespace {
    /// Full key for a namespaced key
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read and decode a JSON value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.tree.get(self.key(key).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                VestibuleError::Storage(format!("corrupt value at {}: {e}", self.key(key)))
            })?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.tree
            .insert(self.key(key).as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(self.key(key).as_bytes())?;
        Ok(())
    }

    /// Whether a key exists
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.tree.contains_key(self.key(key).as_bytes())?)
    }

    /// Keys in this namespace, prefix stripped
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(self.prefix.as_bytes()) {
            let (key, _) = item?;
            if let Ok(key) = String::from_utf8(key[self.prefix.len()..].to_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
