//! Persistence surfaces and their migration
//!
//! - **kv**: flat namespaced key-value store (`wallet/<address>/<key>`)
//! - **objects**: one transactional database per address, tables as trees
//! - **migrator**: moves both between address-encoding generations

pub mod address;
pub mod kv;
pub mod migrator;
pub mod objects;

pub use address::AddressForm;
pub use kv::{KvNamespace, KvStore, MigrationFlag, CANONICAL_KEY};
pub use migrator::{MigrationReport, StorageMigrator};
pub use objects::{db_name, ObjectDb, ObjectStore};
