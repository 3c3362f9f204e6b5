//! Vestibule - background session coordinator for the wallet extension
//!
//! Brokers one locked/unlocked signing session across untrusted page
//! contexts and the interactive approval surface. Ledger logic lives in an
//! external payment engine; Vestibule decides who may ask it for what.
//!
//! ## Components
//!
//! - **Signer**: identity seed → deterministic secondary keypair, Schnorr signing
//! - **Session**: vault-backed single-writer session slot
//! - **Storage**: namespaced key-value store, per-address object databases, migrator
//! - **Broker**: per-origin connection grants, queued while locked
//! - **Approval**: transaction queue, durable approval journal, result router
//! - **Binding**: name-binding drift detection and repair
//! - **Coordinator**: owns all of the above and dispatches inbound messages

pub mod approval;
pub mod binding;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod protocol;
pub mod services;
pub mod session;
pub mod signer;
pub mod storage;
pub mod types;

pub use config::{Args, CoordinatorConfig};
pub use coordinator::{Coordinator, UnlockReport};
pub use types::{Result, VestibuleError};
