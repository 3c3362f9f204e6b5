//! External collaborators
//!
//! The coordinator never constructs transfers, delivers protocol messages or
//! checks token state itself. It talks to those systems through the narrow
//! traits below, so the SDK behind them can change shape without the
//! coordinator depending on its internals.
//!
//! | Trait | Backed by | Used for |
//! |-------|-----------|----------|
//! | `PaymentEngine` | wallet SDK | transfers, balances |
//! | `BindingProofs` | wallet SDK | proof-of-binding artifacts |
//! | `TokenInventory` | wallet SDK | health check input |
//! | `MessageTransport` | relay client | name resolution, binding publication |
//! | `ValidationOracle` | aggregator | health check only |
//! | `ApprovalSurface` | extension popup | foregrounding the approval UI |

pub mod health;
pub mod offline;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use health::{check_tokens, TokenHealthReport};
pub use offline::{LocalDirectory, OfflineEngine};

/// Errors reported by a collaborator
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<CollaboratorError> for crate::types::VestibuleError {
    fn from(err: CollaboratorError) -> Self {
        Self::Collaborator(err.to_string())
    }
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

// ============================================================================
// Payment engine
// ============================================================================

/// Balance of one coin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub coin_id: String,
    pub amount: u64,
}

/// Result of a settled transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Engine-assigned transfer id
    pub transfer_id: String,
    pub coin_id: String,
    pub amount: u64,
    pub recipient: String,
}

/// Result of accepting an incoming transfer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveOutcome {
    pub coin_id: String,
    pub amount: u64,
}

/// Transfers and balances
#[async_trait::async_trait]
pub trait PaymentEngine: Send + Sync {
    /// Construct and broadcast a transfer
    async fn send(
        &self,
        coin_id: &str,
        amount: u64,
        recipient: &str,
    ) -> CollaboratorResult<TransferReceipt>;

    /// Accept an incoming transfer payload
    async fn receive(&self, payload: &str) -> CollaboratorResult<ReceiveOutcome>;

    /// Current balances
    async fn get_balances(&self) -> CollaboratorResult<Vec<Balance>>;
}

// ============================================================================
// Binding proofs
// ============================================================================

/// On-chain object certifying ownership of a name binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub name: String,
    /// Fingerprint the artifact certifies
    pub fingerprint: String,
    /// Key-derivation scheme in force when the artifact was minted
    pub derivation_scheme: u32,
}

/// Proof-of-binding capability committed by the payment engine
#[async_trait::async_trait]
pub trait BindingProofs: Send + Sync {
    /// Current artifact for `name`, if one exists
    async fn binding_proof(&self, name: &str) -> CollaboratorResult<Option<ProofArtifact>>;

    /// Mint a replacement artifact certifying `fingerprint`
    async fn regenerate_binding_proof(
        &self,
        name: &str,
        fingerprint: &str,
        derivation_scheme: u32,
    ) -> CollaboratorResult<ProofArtifact>;
}

// ============================================================================
// Token inventory + validation oracle
// ============================================================================

/// Opaque token held by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRef {
    pub token_id: String,
    pub coin_id: String,
    pub amount: u64,
}

/// Oracle verdict for one token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidity {
    pub valid: bool,
    pub spent: bool,
}

/// Token listing capability committed by the payment engine
#[async_trait::async_trait]
pub trait TokenInventory: Send + Sync {
    async fn tokens(&self) -> CollaboratorResult<Vec<TokenRef>>;
}

/// Checks on-chain token state
#[async_trait::async_trait]
pub trait ValidationOracle: Send + Sync {
    async fn validate(&self, token: &TokenRef) -> CollaboratorResult<TokenValidity>;
}

// ============================================================================
// Message transport
// ============================================================================

/// Secondary-protocol transport
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    /// Connect as `public_key` (hex x-only)
    async fn connect(&self, public_key: &str) -> CollaboratorResult<()>;

    /// Resolve a name to the key it is bound to
    async fn resolve_name(&self, name: &str) -> CollaboratorResult<Option<String>>;

    /// Publish `name → target`; `false` when the directory refused it
    async fn publish_binding(&self, name: &str, target: &str) -> CollaboratorResult<bool>;
}

// ============================================================================
// Approval surface
// ============================================================================

/// Interactive approval UI
#[async_trait::async_trait]
pub trait ApprovalSurface: Send + Sync {
    /// Ask for the surface to be brought to the foreground
    async fn foreground(&self);
}

/// Surface that does nothing (headless hosts)
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSurface;

#[async_trait::async_trait]
impl ApprovalSurface for HeadlessSurface {
    async fn foreground(&self) {
        tracing::debug!("Approval surface requested (headless)");
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every collaborator the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn PaymentEngine>,
    pub proofs: Arc<dyn BindingProofs>,
    pub inventory: Arc<dyn TokenInventory>,
    pub oracle: Arc<dyn ValidationOracle>,
    pub transport: Arc<dyn MessageTransport>,
    pub surface: Arc<dyn ApprovalSurface>,
}

impl Collaborators {
    /// No payment engine; bindings kept in `directory`
    pub fn offline(directory: LocalDirectory) -> Self {
        Self {
            engine: Arc::new(OfflineEngine),
            proofs: Arc::new(OfflineEngine),
            inventory: Arc::new(OfflineEngine),
            oracle: Arc::new(OfflineEngine),
            transport: Arc::new(directory),
            surface: Arc::new(HeadlessSurface),
        }
    }
}
