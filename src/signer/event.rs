//! Secondary-protocol events.
//!
//! An event id is the SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; the signature covers that
//! id. Pages submit unsigned events and receive the signed form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::DerivedKeys;
use super::schnorr;
use crate::types::Result;

/// Event as submitted by a page, before the coordinator signs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Unix seconds
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

/// Event signed by the session's secondary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    /// Hex SHA-256 of the canonical serialization
    pub id: String,
    /// Hex x-only public key
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Hex BIP-340 signature over `id`
    pub sig: String,
}

impl UnsignedEvent {
    /// Compute the event id for the given author key
    pub fn id(&self, pubkey_hex: &str) -> Result<[u8; 32]> {
        let canonical = serde_json::to_string(&serde_json::json!([
            0,
            pubkey_hex,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]))?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    /// Sign with the session's derived keys
    pub fn sign(self, keys: &DerivedKeys) -> Result<SignedEvent> {
        let pubkey = keys.public_key_hex();
        let id = self.id(&pubkey)?;
        let sig = schnorr::sign_hash(&keys.private_key, &id)?;

        Ok(SignedEvent {
            id: hex::encode(id),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        })
    }
}

impl SignedEvent {
    /// Check that the id matches the content and the signature matches the id
    pub fn verify(&self) -> bool {
        let unsigned = UnsignedEvent {
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        let Ok(id) = unsigned.id(&self.pubkey) else {
            return false;
        };
        if hex::encode(id) != self.id {
            return false;
        }

        let Ok(pubkey) = super::keys::parse_public_key(&self.pubkey) else {
            return false;
        };
        let Ok(sig) = hex::decode(&self.sig) else {
            return false;
        };
        schnorr::verify_hash(&pubkey, &id, &sig)
    }
}
