//! BIP-340 Schnorr signing over secp256k1 with deterministic nonces.
//!
//! Receivers use signature bytes for replay detection, so a (key, message)
//! pair must always produce the same signature. Auxiliary randomness is fixed
//! to zero for that reason.

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::types::{Result, VestibuleError};

/// Fixed auxiliary randomness fed to the BIP-340 nonce derivation
const AUX_RAND: [u8; 32] = [0u8; 32];

/// Length of a prehashed message
pub const HASH_LEN: usize = 32;

/// Length of an encoded signature
pub const SIGNATURE_LEN: usize = 64;

fn signing_key(private_key: &[u8; 32]) -> Result<SigningKey> {
    SigningKey::from_bytes(private_key)
        .map_err(|_| VestibuleError::Identity("invalid secondary private key".into()))
}

/// Sign an exactly 32-byte hash.
pub fn sign_hash(private_key: &[u8; 32], hash: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    if hash.len() != HASH_LEN {
        return Err(VestibuleError::InputSize {
            expected: HASH_LEN,
            actual: hash.len(),
        });
    }

    let signature = signing_key(private_key)?
        .sign_raw(hash, &AUX_RAND)
        .map_err(|e| VestibuleError::Internal(format!("schnorr signing failed: {e}")))?;

    Ok(signature.to_bytes())
}

/// Sign an arbitrary message (SHA-256 of the message is what gets signed).
pub fn sign_message(private_key: &[u8; 32], message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let digest = Sha256::digest(message);
    sign_hash(private_key, &digest)
}

/// Verify a signature over a 32-byte hash. Never errors.
pub fn verify_hash(public_key: &[u8; 32], hash: &[u8], signature: &[u8]) -> bool {
    if hash.len() != HASH_LEN {
        return false;
    }
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    key.verify_raw(hash, &signature).is_ok()
}

/// Verify a signature produced by [`sign_message`]. Never errors.
pub fn verify_message(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    verify_hash(public_key, &digest, signature)
}
