//! Session management
//!
//! The vault holds the encrypted identity seed; the store holds the one
//! unlocked session derived from it.

pub mod store;
pub mod vault;

use serde::{Deserialize, Serialize};

use crate::storage::address::AddressForm;
use crate::types::Result;

pub use store::{Session, SessionStore};
pub use vault::{KdfParams, Vault, VaultFile};

/// Identity snapshot handed to connected origins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIdentity {
    /// Hex x-only secondary public key
    pub public_key: String,

    /// `npub1...` encoding of `public_key`
    pub public_key_encoded: String,

    /// Fingerprint of `public_key`
    pub fingerprint: String,

    /// Wallet address in the current encoding
    pub address: String,
}

impl ActiveIdentity {
    /// Snapshot the identity of a live session
    pub fn from_session(session: &Session) -> Result<Self> {
        let keys = session.derived_keys()?;
        Ok(Self {
            public_key: keys.public_key_hex(),
            fingerprint: keys.fingerprint(),
            public_key_encoded: keys.public_key_encoded.clone(),
            address: AddressForm::CURRENT.encode(session.identity_key())?,
        })
    }
}
