//! Key Derivation & Signer
//!
//! Derives the session's secondary-protocol identity from the identity seed
//! and signs with it.
//!
//! # Guarantees
//!
//! - `derive(seed)` is pure: same seed, byte-identical keys
//! - `sign(key, msg)` is deterministic: same inputs, byte-identical signature
//! - keys are never persisted; they are recomputed from the live session
//!
//! # Failure Modes
//!
//! - malformed seed → `VestibuleError::Identity`
//! - prehash not exactly 32 bytes → `VestibuleError::InputSize`
//! - verification returns `bool` and never errors

pub mod event;
pub mod keys;
pub mod schnorr;

pub use event::{SignedEvent, UnsignedEvent};
pub use keys::{
    derive, encode_public_key, fingerprint, identity_public_key, parse_public_key, DerivedKeys,
    DERIVATION_SCHEME, PUBLIC_KEY_HRP,
};
pub use schnorr::{sign_hash, sign_message, verify_hash, verify_message};
