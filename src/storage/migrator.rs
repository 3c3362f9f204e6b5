//! Storage Migrator
//!
//! Moves persisted data from one address generation to the next, across both
//! persistence surfaces.
//!
//! # Algorithm
//!
//! ```text
//! migrate(old, new):
//!   canonical key present under new namespace? ── yes ──▶ no-op
//!        │ no
//!        ▼
//!   copy kv  wallet/<old>/*  ──▶ wallet/<new>/*     (canonical key held back)
//!   copy every table of db(old) ──▶ db(new)
//!   copy canonical key                              (last: marks completion)
//!   flush, evict both database handles
//! ```
//!
//! The copy is a set-union with overwrite, so an interrupted run resumes by
//! running it again. Writing the canonical key last keeps an interrupted run
//! from looking finished.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::kv::{KvStore, CANONICAL_KEY};
use super::objects::ObjectStore;
use crate::types::{Result, VestibuleError};

/// Outcome of one migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Destination already canonical; nothing was touched
    pub skipped: bool,
    /// Key-value entries written under the new namespace
    pub keys_copied: usize,
    /// Tables copied into the new per-address database
    pub tables_copied: usize,
    /// Records copied across all tables
    pub records_copied: usize,
}

impl MigrationReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Migrates both persistence surfaces between address forms
#[derive(Clone)]
pub struct StorageMigrator {
    kv: KvStore,
    objects: Arc<ObjectStore>,
}

impl StorageMigrator {
    pub fn new(kv: KvStore, objects: Arc<ObjectStore>) -> Self {
        Self { kv, objects }
    }

    /// Copy everything stored under `old_address` to `new_address`.
    ///
    /// Any failure is reported as `MigrationPartial`; re-running resumes.
    pub fn migrate(&self, old_address: &str, new_address: &str) -> Result<MigrationReport> {
        if old_address == new_address {
            return Ok(MigrationReport::skipped());
        }

        let old_prefix = KvStore::prefix(old_address);
        let new_prefix = KvStore::prefix(new_address);
        let canonical = format!("{new_prefix}{CANONICAL_KEY}");

        if self.kv.contains(&canonical).map_err(partial)? {
            debug!(new = %new_address, "Destination namespace already canonical, skipping");
            return Ok(MigrationReport::skipped());
        }

        let mut report = MigrationReport::default();

        // 1. Key-value namespace, canonical key held back
        let entries = self.kv.scan_prefix(&old_prefix).map_err(partial)?;
        let mut held_back = None;
        for (key, value) in entries {
            let suffix = &key[old_prefix.len()..];
            if suffix == CANONICAL_KEY {
                held_back = Some(value);
                continue;
            }
            self.kv
                .put_raw(&format!("{new_prefix}{suffix}"), &value)
                .map_err(partial)?;
            report.keys_copied += 1;
        }

        // 2. Per-address object database
        if self.objects.exists(old_address) {
            let (tables, records) = self.copy_tables(old_address, new_address)?;
            report.tables_copied = tables;
            report.records_copied = records;
        }

        // 3. Canonical key marks the destination complete
        if let Some(value) = held_back {
            self.kv.put_raw(&canonical, &value).map_err(partial)?;
            report.keys_copied += 1;
        }
        self.kv.flush().map_err(partial)?;

        // Results are only guaranteed visible to fresh handles
        self.objects.evict(old_address).map_err(partial)?;
        self.objects.evict(new_address).map_err(partial)?;

        info!(
            old = %old_address,
            new = %new_address,
            keys = report.keys_copied,
            tables = report.tables_copied,
            records = report.records_copied,
            "Storage migration complete"
        );
        Ok(report)
    }

    fn copy_tables(&self, old_address: &str, new_address: &str) -> Result<(usize, usize)> {
        let source = self.objects.open(old_address).map_err(partial)?;
        let destination = self.objects.open(new_address).map_err(partial)?;

        let mut tables = 0;
        let mut records = 0;
        for table in source.tables() {
            let from = source.table(&table).map_err(partial)?;
            let to = destination.table(&table).map_err(partial)?;
            for item in from.iter() {
                let (key, value) = item.map_err(|e| partial(e.into()))?;
                to.insert(key, value).map_err(|e| partial(e.into()))?;
                records += 1;
            }
            tables += 1;
        }
        destination.flush().map_err(partial)?;
        Ok((tables, records))
    }

    /// Run `migrate` once per `migration_id`, recording a flag on success.
    ///
    /// Returns `None` when the flag was already set.
    pub fn run_once(
        &self,
        migration_id: &str,
        old_address: &str,
        new_address: &str,
    ) -> Result<Option<MigrationReport>> {
        if self.kv.flag(migration_id).map_err(partial)?.is_some() {
            return Ok(None);
        }

        match self.migrate(old_address, new_address) {
            Ok(report) => {
                self.kv.set_flag(migration_id).map_err(partial)?;
                Ok(Some(report))
            }
            Err(e) => {
                warn!(migration = %migration_id, error = %e, "Migration incomplete, will retry");
                Err(e)
            }
        }
    }
}

fn partial(err: VestibuleError) -> VestibuleError {
    match err {
        VestibuleError::MigrationPartial(_) => err,
        other => VestibuleError::MigrationPartial(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        kv: KvStore,
        objects: Arc<ObjectStore>,
        migrator: StorageMigrator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::open(dir.path().join("kv")).unwrap();
        let objects = Arc::new(ObjectStore::new(dir.path().join("objects")));
        let migrator = StorageMigrator::new(kv.clone(), Arc::clone(&objects));
        Fixture {
            _dir: dir,
            kv,
            objects,
            migrator,
        }
    }

    #[test]
    fn test_migrates_both_surfaces() {
        let f = fixture();
        let old = f.kv.namespace("old");
        old.put(CANONICAL_KEY, &"id-record").unwrap();
        old.put("name", &"alice").unwrap();
        {
            let db = f.objects.open("old").unwrap();
            db.put_record("tokens", "t1", &10).unwrap();
            db.put_record("tokens", "t2", &20).unwrap();
            db.put_record("history", "h1", &"x").unwrap();
        }

        let report = f.migrator.migrate("old", "new").unwrap();
        assert!(!report.skipped);
        assert_eq!(report.keys_copied, 2);
        assert_eq!(report.tables_copied, 2);
        assert_eq!(report.records_copied, 3);

        let new = f.kv.namespace("new");
        assert_eq!(new.get::<String>("name").unwrap(), Some("alice".into()));
        assert!(new.contains(CANONICAL_KEY).unwrap());

        let db = f.objects.open("new").unwrap();
        assert_eq!(db.get_record::<i32>("tokens", "t2").unwrap(), Some(20));
        assert_eq!(db.count("history").unwrap(), 1);

        // Source is left intact
        assert_eq!(old.get::<String>("name").unwrap(), Some("alice".into()));
    }

    #[test]
    fn test_canonical_destination_is_untouched() {
        let f = fixture();
        f.kv.namespace("old").put("name", &"old-name").unwrap();
        let new = f.kv.namespace("new");
        new.put(CANONICAL_KEY, &"already").unwrap();
        new.put("name", &"new-name").unwrap();

        let report = f.migrator.migrate("old", "new").unwrap();
        assert!(report.skipped);
        assert_eq!(new.get::<String>("name").unwrap(), Some("new-name".into()));
    }

    #[test]
    fn test_resume_after_partial_run() {
        let f = fixture();
        let old = f.kv.namespace("old");
        old.put(CANONICAL_KEY, &"id").unwrap();
        old.put("a", &1).unwrap();
        old.put("b", &2).unwrap();

        // Simulate an interrupted earlier run that only wrote one key
        f.kv.namespace("new").put("a", &1).unwrap();

        let report = f.migrator.migrate("old", "new").unwrap();
        assert!(!report.skipped);

        let new = f.kv.namespace("new");
        let mut keys = new.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", CANONICAL_KEY]);
    }

    #[test]
    fn test_run_once_sets_flag() {
        let f = fixture();
        f.kv.namespace("old").put("a", &1).unwrap();

        assert!(f.migrator.run_once("m", "old", "new").unwrap().is_some());
        assert!(f.kv.flag("m").unwrap().is_some());
        assert!(f.migrator.run_once("m", "old", "new").unwrap().is_none());
    }

    #[test]
    fn test_same_address_is_noop() {
        let f = fixture();
        assert!(f.migrator.migrate("same", "same").unwrap().skipped);
    }
}
