//! Encrypted identity seed on disk.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id (memory-hard, brute-force resistant)
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//!
//! The unlock secret never leaves this module: it derives a key encryption
//! key, the KEK decrypts the 32-byte identity seed, and a failed
//! authentication tag is reported as a wrong secret.
//!
//! KDF parameters are written into the vault file so a vault always opens
//! with the parameters it was sealed with.

use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::signer::keys::{identity_public_key, SEED_LEN};
use crate::types::{Result, VestibuleError};

// =============================================================================
// Constants
// =============================================================================

/// Current vault file format
pub const VAULT_VERSION: u32 = 1;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Vault file name inside the data directory
pub const VAULT_FILE: &str = "vault.json";

// =============================================================================
// KDF Parameters
// =============================================================================

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kb: u32,
    /// Iteration count
    pub iterations: u32,
    /// Parallelism (threads)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kb: 65536, // 64 MB
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and development vaults
    pub fn insecure_fast() -> Self {
        Self {
            memory_kb: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}

// =============================================================================
// Vault File
// =============================================================================

/// On-disk vault format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultFile {
    /// Version of the vault format (for forward compatibility)
    pub version: u32,

    /// Compressed identity public key (hex) - lets callers show the identity while locked
    pub identity_public_key: String,

    /// Encrypted identity seed (base64) - 32 bytes + 16 byte auth tag
    pub encrypted_seed: String,

    /// Key derivation salt (base64)
    pub kdf_salt: String,

    /// Encryption nonce (base64)
    pub nonce: String,

    /// Argon2id parameters used to seal this vault
    pub kdf: KdfParams,

    /// When the vault was created (RFC 3339)
    pub created_at: String,
}

/// Handle to the vault file in a data directory
#[derive(Debug, Clone)]
pub struct Vault {
    path: PathBuf,
}

impl Vault {
    /// Vault stored at `<data_dir>/vault.json`
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(VAULT_FILE),
        }
    }

    /// Vault stored at an explicit path
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the vault file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a vault has been created
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Seal `seed` under `secret` and write the vault file.
    pub fn create(&self, secret: &str, seed: &[u8; SEED_LEN], kdf: KdfParams) -> Result<VaultFile> {
        if secret.is_empty() {
            return Err(VestibuleError::Auth("unlock secret must not be empty".into()));
        }

        // Rejects seeds that are not usable identity keys
        let identity_key = identity_public_key(seed)?;

        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let kek = derive_key_encryption_key(secret.as_bytes(), &salt, kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_slice()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), seed.as_slice())
            .map_err(|e| VestibuleError::Internal(format!("Encryption failed: {e}")))?;

        let file = VaultFile {
            version: VAULT_VERSION,
            identity_public_key: hex::encode(identity_key),
            encrypted_seed: BASE64.encode(&ciphertext),
            kdf_salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            kdf,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&file)?)?;

        info!(path = %self.path.display(), "Created wallet vault");
        Ok(file)
    }

    /// Read the vault file without decrypting it
    pub fn load(&self) -> Result<VaultFile> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VestibuleError::Auth("no wallet vault has been created".into())
            } else {
                VestibuleError::Storage(format!("failed to read vault: {e}"))
            }
        })?;

        let file: VaultFile = serde_json::from_slice(&bytes)
            .map_err(|e| VestibuleError::Storage(format!("corrupt vault file: {e}")))?;

        if file.version != VAULT_VERSION {
            return Err(VestibuleError::Storage(format!(
                "unsupported vault version {}",
                file.version
            )));
        }
        Ok(file)
    }

    /// Decrypt the identity seed. Wrong or missing credential is `Auth`.
    pub fn open(&self, secret: &str) -> Result<Zeroizing<[u8; SEED_LEN]>> {
        if secret.is_empty() {
            return Err(VestibuleError::Auth("missing unlock secret".into()));
        }
        let file = self.load()?;

        let salt = BASE64
            .decode(&file.kdf_salt)
            .map_err(|e| VestibuleError::Storage(format!("Invalid salt encoding: {e}")))?;
        let nonce = BASE64
            .decode(&file.nonce)
            .map_err(|e| VestibuleError::Storage(format!("Invalid nonce encoding: {e}")))?;
        let ciphertext = BASE64
            .decode(&file.encrypted_seed)
            .map_err(|e| VestibuleError::Storage(format!("Invalid ciphertext encoding: {e}")))?;

        if nonce.len() != NONCE_LEN {
            return Err(VestibuleError::Storage(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }

        let kek = derive_key_encryption_key(secret.as_bytes(), &salt, file.kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| VestibuleError::Auth("wrong unlock secret".into()))?,
        );

        if plaintext.len() != SEED_LEN {
            return Err(VestibuleError::Storage(format!(
                "Invalid decrypted seed length: expected {}, got {}",
                SEED_LEN,
                plaintext.len()
            )));
        }

        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        seed.copy_from_slice(&plaintext);
        debug!("Vault opened");
        Ok(seed)
    }
}

// =============================================================================
// Primitives
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh identity seed that is a valid secp256k1 scalar.
pub fn generate_seed() -> Zeroizing<[u8; SEED_LEN]> {
    loop {
        let seed = Zeroizing::new(generate_random_bytes::<SEED_LEN>());
        if identity_public_key(seed.as_slice()).is_ok() {
            return seed;
        }
    }
}

/// Derive a 256-bit key encryption key from the unlock secret using Argon2id.
pub fn derive_key_encryption_key(
    secret: &[u8],
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(kdf.memory_kb, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| VestibuleError::Internal(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(secret, salt, key.as_mut_slice())
        .map_err(|e| VestibuleError::Internal(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

// =============================================================================
// Tests
// =============================================================================
