//! Address-encoding generations.
//!
//! Both persistence surfaces are keyed by the wallet address, and the
//! address encoding has changed between software generations. Each form
//! here is one generation; data written under an older form is migrated to
//! [`AddressForm::CURRENT`].

use bech32::{ToBase32, Variant};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::signer::keys::IDENTITY_KEY_LEN;
use crate::types::{Result, VestibuleError};

/// Human-readable prefix for bech32 addresses
pub const ADDRESS_HRP: &str = "addr";

/// Bytes of the identity-key digest carried in a bech32 address
const ADDRESS_PAYLOAD_LEN: usize = 20;

/// One address-encoding generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressForm {
    /// Hex of the compressed identity key
    Legacy,
    /// bech32 of the truncated SHA-256 of the identity key
    Bech32,
}

impl AddressForm {
    /// The form new data is written under
    pub const CURRENT: AddressForm = AddressForm::Bech32;

    /// The form immediately preceding `self`, if any
    pub fn previous(self) -> Option<AddressForm> {
        match self {
            Self::Legacy => None,
            Self::Bech32 => Some(Self::Legacy),
        }
    }

    /// Encode the identity key under this form
    pub fn encode(self, identity_key: &[u8; IDENTITY_KEY_LEN]) -> Result<String> {
        match self {
            Self::Legacy => Ok(hex::encode(identity_key)),
            Self::Bech32 => {
                let digest = Sha256::digest(identity_key);
                bech32::encode(
                    ADDRESS_HRP,
                    (&digest[..ADDRESS_PAYLOAD_LEN]).to_base32(),
                    Variant::Bech32,
                )
                .map_err(|e| VestibuleError::Identity(format!("address encoding failed: {e}")))
            }
        }
    }

    /// Identifier of the one-time migration into this form
    pub fn migration_id(self) -> String {
        match self {
            Self::Legacy => "address-form-legacy".to_string(),
            Self::Bech32 => "address-form-bech32".to_string(),
        }
    }
}
