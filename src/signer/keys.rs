//! Deterministic secondary-identity key derivation.
//!
//! # Scheme
//!
//! ```text
//! identity seed ──▶ secp256k1 identity key ──▶ compressed SEC1 point (33 bytes)
//!                                                   │
//!                    DERIVATION_LABEL ‖ point ──▶ SHA-256 ──▶ secondary private scalar
//!                                                                   │
//!                                                        x-only public key (32 bytes)
//!                                                                   │
//!                                                        bech32("npub", x-only key)
//! ```
//!
//! Nothing here touches an RNG and nothing is persisted: callers recompute the
//! keys from the live session whenever they need them.

use bech32::{FromBase32, ToBase32, Variant};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::schnorr::SigningKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::types::{Result, VestibuleError};

// =============================================================================
// Constants
// =============================================================================

/// Domain-separation label prefixed to the identity key before hashing
pub const DERIVATION_LABEL: &[u8] = b"vestibule/secondary-identity";

/// Version of the derivation scheme above.
///
/// Bumped whenever the derivation changes; proof artifacts minted under an
/// older scheme are regenerated once (see the binding reconciler).
pub const DERIVATION_SCHEME: u32 = 2;

/// Human-readable prefix of encoded secondary public keys
pub const PUBLIC_KEY_HRP: &str = "npub";

/// Identity seed length (32 bytes)
pub const SEED_LEN: usize = 32;

/// Compressed SEC1 identity public key length (33 bytes)
pub const IDENTITY_KEY_LEN: usize = 33;

/// Fingerprint length in bytes before hex encoding
const FINGERPRINT_LEN: usize = 8;

// =============================================================================
// Derived Keys
// =============================================================================

/// Secondary-protocol keypair derived from an identity seed.
///
/// The private scalar is zeroized when dropped.
#[derive(Clone)]
pub struct DerivedKeys {
    /// Secondary private scalar (sensitive!)
    pub private_key: Zeroizing<[u8; 32]>,

    /// x-only public key
    pub public_key: [u8; 32],

    /// bech32 encoding of `public_key` with the `npub` prefix
    pub public_key_encoded: String,
}

impl DerivedKeys {
    /// Lowercase hex of the x-only public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Fingerprint of the public key (see [`fingerprint`])
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("public_key", &self.public_key_hex())
            .field("public_key_encoded", &self.public_key_encoded)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Derivation
// =============================================================================

/// Compute the compressed identity public key for a seed.
pub fn identity_public_key(identity_seed: &[u8]) -> Result<[u8; IDENTITY_KEY_LEN]> {
    if identity_seed.len() != SEED_LEN {
        return Err(VestibuleError::Identity(format!(
            "seed must be {} bytes, got {}",
            SEED_LEN,
            identity_seed.len()
        )));
    }

    let secret = k256::SecretKey::from_bytes(k256::FieldBytes::from_slice(identity_seed))
        .map_err(|_| VestibuleError::Identity("seed is not a valid secp256k1 scalar".into()))?;

    let point = secret.public_key().to_encoded_point(true);
    let mut out = [0u8; IDENTITY_KEY_LEN];
    out.copy_from_slice(point.as_bytes());
    Ok(out)
}

/// Derive the secondary-protocol keypair for an identity seed.
///
/// Pure: the same seed always yields byte-identical keys.
pub fn derive(identity_seed: &[u8]) -> Result<DerivedKeys> {
    let identity_key = identity_public_key(identity_seed)?;
    derive_from_identity_key(&identity_key)
}

/// Derive the secondary keypair from an already computed identity key.
pub fn derive_from_identity_key(identity_key: &[u8; IDENTITY_KEY_LEN]) -> Result<DerivedKeys> {
    let mut hasher = Sha256::new();
    hasher.update(DERIVATION_LABEL);
    hasher.update(identity_key);
    let digest: [u8; 32] = hasher.finalize().into();
    let private_key = Zeroizing::new(digest);

    let signing_key = SigningKey::from_bytes(private_key.as_slice())
        .map_err(|_| VestibuleError::Identity("derived scalar out of range".into()))?;

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&signing_key.verifying_key().to_bytes());

    let public_key_encoded = encode_public_key(&public_key)?;

    Ok(DerivedKeys {
        private_key,
        public_key,
        public_key_encoded,
    })
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode an x-only public key as `npub1...`
pub fn encode_public_key(public_key: &[u8; 32]) -> Result<String> {
    bech32::encode(PUBLIC_KEY_HRP, public_key.to_base32(), Variant::Bech32)
        .map_err(|e| VestibuleError::Identity(format!("bech32 encoding failed: {e}")))
}

/// Parse either an `npub1...` string or 64 hex characters into an x-only key.
pub fn parse_public_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = if encoded.starts_with(PUBLIC_KEY_HRP) {
        let (hrp, data, variant) = bech32::decode(encoded)
            .map_err(|e| VestibuleError::Identity(format!("invalid bech32 key: {e}")))?;
        if hrp != PUBLIC_KEY_HRP || variant != Variant::Bech32 {
            return Err(VestibuleError::Identity(format!(
                "unexpected key prefix: {hrp}"
            )));
        }
        Vec::<u8>::from_base32(&data)
            .map_err(|e| VestibuleError::Identity(format!("invalid bech32 payload: {e}")))?
    } else {
        hex::decode(encoded)
            .map_err(|e| VestibuleError::Identity(format!("invalid hex key: {e}")))?
    };

    bytes.as_slice().try_into().map_err(|_| {
        VestibuleError::Identity(format!("public key must be 32 bytes, got {}", bytes.len()))
    })
}

/// Short deterministic digest of a public key, used to detect binding drift.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..FINGERPRINT_LEN])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn test_derive_is_pure() {
        let a = derive(&SEED).unwrap();
        let b = derive(&SEED).unwrap();

        assert_eq!(*a.private_key, *b.private_key);
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.public_key_encoded, b.public_key_encoded);
    }

    #[test]
    fn test_different_seeds_different_keys() {
        let a = derive(&SEED).unwrap();
        let b = derive(&[8u8; 32]).unwrap();
        assert_ne!(a.public_key, b.public_key);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_private_key_is_label_hash_of_identity_key() {
        let identity_key = identity_public_key(&SEED).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(DERIVATION_LABEL);
        hasher.update(identity_key);
        let expected: [u8; 32] = hasher.finalize().into();

        let keys = derive(&SEED).unwrap();
        assert_eq!(*keys.private_key, expected);
    }

    #[test]
    fn test_identity_key_is_compressed() {
        let identity_key = identity_public_key(&SEED).unwrap();
        assert!(identity_key[0] == 0x02 || identity_key[0] == 0x03);
    }

    #[test]
    fn test_malformed_seed_is_identity_error() {
        assert!(matches!(
            derive(&[1u8; 16]),
            Err(VestibuleError::Identity(_))
        ));
        // Zero is not a valid scalar
        assert!(matches!(
            derive(&[0u8; 32]),
            Err(VestibuleError::Identity(_))
        ));
        // Above the curve order
        assert!(matches!(
            derive(&[0xffu8; 32]),
            Err(VestibuleError::Identity(_))
        ));
    }

    #[test]
    fn test_encoded_key_has_prefix_and_parses_back() {
        let keys = derive(&SEED).unwrap();
        assert!(keys.public_key_encoded.starts_with("npub1"));

        assert_eq!(parse_public_key(&keys.public_key_encoded).unwrap(), keys.public_key);
        assert_eq!(parse_public_key(&keys.public_key_hex()).unwrap(), keys.public_key);
    }

    #[test]
    fn test_parse_rejects_corrupted_checksum() {
        let keys = derive(&SEED).unwrap();
        let mut corrupted = keys.public_key_encoded.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == 'q' { 'p' } else { 'q' });

        assert!(parse_public_key(&corrupted).is_err());
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let keys = derive(&SEED).unwrap();
        let fp = keys.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&keys.public_key));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let keys = derive(&SEED).unwrap();
        let debug = format!("{:?}", keys);
        assert!(!debug.contains(&hex::encode(*keys.private_key)));
    }
}
