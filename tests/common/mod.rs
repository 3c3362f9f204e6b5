//! Shared fixtures for coordinator integration tests
//!
//! Mock collaborators record what the coordinator asked of them so tests
//! can assert on side effects (transfers sent, bindings published).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use vestibule::services::{
    ApprovalSurface, Balance, BindingProofs, CollaboratorError, CollaboratorResult, Collaborators,
    MessageTransport, PaymentEngine, ProofArtifact, ReceiveOutcome, TokenInventory, TokenRef,
    TokenValidity, TransferReceipt, ValidationOracle,
};
use vestibule::session::{KdfParams, Vault};
use vestibule::signer::{self, DerivedKeys, DERIVATION_SCHEME};
use vestibule::{Coordinator, CoordinatorConfig};

pub const SECRET: &str = "correct-secret";
pub const SEED: [u8; 32] = [7u8; 32];

/// Keys every harness wallet derives to
pub fn wallet_keys() -> DerivedKeys {
    signer::derive(&SEED).unwrap()
}

/// Keys of some other wallet
pub fn other_keys() -> DerivedKeys {
    signer::derive(&[8u8; 32]).unwrap()
}

// =============================================================================
// Payment engine
// =============================================================================

#[derive(Default)]
pub struct MockEngine {
    pub sends: AtomicUsize,
    pub fail_sends: AtomicBool,
}

#[async_trait::async_trait]
impl PaymentEngine for MockEngine {
    async fn send(
        &self,
        coin_id: &str,
        amount: u64,
        recipient: &str,
    ) -> CollaboratorResult<TransferReceipt> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Timeout("aggregator did not answer".into()));
        }
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransferReceipt {
            transfer_id: format!("tx-{n}"),
            coin_id: coin_id.to_string(),
            amount,
            recipient: recipient.to_string(),
        })
    }

    async fn receive(&self, payload: &str) -> CollaboratorResult<ReceiveOutcome> {
        Ok(ReceiveOutcome {
            coin_id: payload.to_string(),
            amount: 1,
        })
    }

    async fn get_balances(&self) -> CollaboratorResult<Vec<Balance>> {
        Ok(vec![Balance {
            coin_id: "ALPHA".into(),
            amount: 100,
        }])
    }
}

#[async_trait::async_trait]
impl TokenInventory for MockEngine {
    async fn tokens(&self) -> CollaboratorResult<Vec<TokenRef>> {
        Ok(vec![
            TokenRef {
                token_id: "fresh-1".into(),
                coin_id: "ALPHA".into(),
                amount: 60,
            },
            TokenRef {
                token_id: "spent-1".into(),
                coin_id: "ALPHA".into(),
                amount: 40,
            },
        ])
    }
}

/// Marks tokens whose id starts with `spent` as spent
pub struct MockOracle;

#[async_trait::async_trait]
impl ValidationOracle for MockOracle {
    async fn validate(&self, token: &TokenRef) -> CollaboratorResult<TokenValidity> {
        let spent = token.token_id.starts_with("spent");
        Ok(TokenValidity { valid: !spent, spent })
    }
}

// =============================================================================
// Directory + proofs
// =============================================================================

#[derive(Default)]
pub struct MockDirectory {
    names: Mutex<HashMap<String, String>>,
    pub publishes: AtomicUsize,
    pub unreachable: AtomicBool,
}

impl MockDirectory {
    /// Bind `name` directly, as another device would
    pub fn set(&self, name: &str, target: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(name.to_string(), target.to_string());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.names.lock().unwrap().get(name).cloned()
    }

    fn check(&self) -> CollaboratorResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("relay offline".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageTransport for MockDirectory {
    async fn connect(&self, _public_key: &str) -> CollaboratorResult<()> {
        self.check()
    }

    async fn resolve_name(&self, name: &str) -> CollaboratorResult<Option<String>> {
        self.check()?;
        Ok(self.get(name))
    }

    async fn publish_binding(&self, name: &str, target: &str) -> CollaboratorResult<bool> {
        self.check()?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.set(name, target);
        Ok(true)
    }
}

#[derive(Default)]
pub struct MockProofs {
    artifacts: Mutex<HashMap<String, ProofArtifact>>,
    pub regenerations: AtomicUsize,
}

#[async_trait::async_trait]
impl BindingProofs for MockProofs {
    async fn binding_proof(&self, name: &str) -> CollaboratorResult<Option<ProofArtifact>> {
        Ok(self.artifacts.lock().unwrap().get(name).cloned())
    }

    async fn regenerate_binding_proof(
        &self,
        name: &str,
        fingerprint: &str,
        derivation_scheme: u32,
    ) -> CollaboratorResult<ProofArtifact> {
        self.regenerations.fetch_add(1, Ordering::SeqCst);
        let artifact = ProofArtifact {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            derivation_scheme,
        };
        self.artifacts
            .lock()
            .unwrap()
            .insert(name.to_string(), artifact.clone());
        Ok(artifact)
    }
}

impl MockProofs {
    pub fn current_scheme(&self, name: &str) -> Option<u32> {
        self.artifacts
            .lock()
            .unwrap()
            .get(name)
            .map(|a| a.derivation_scheme)
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.current_scheme(name) == Some(DERIVATION_SCHEME)
    }
}

// =============================================================================
// Surface
// =============================================================================

#[derive(Default)]
pub struct CountingSurface {
    pub foregrounds: AtomicUsize,
}

#[async_trait::async_trait]
impl ApprovalSurface for CountingSurface {
    async fn foreground(&self) {
        self.foregrounds.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub engine: Arc<MockEngine>,
    pub directory: Arc<MockDirectory>,
    pub proofs: Arc<MockProofs>,
    pub surface: Arc<CountingSurface>,
    pub dir: TempDir,
}

impl Harness {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            engine: self.engine.clone(),
            proofs: self.proofs.clone(),
            inventory: self.engine.clone(),
            oracle: Arc::new(MockOracle),
            transport: self.directory.clone(),
            surface: self.surface.clone(),
        }
    }

    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(self.dir.path())
    }

    /// Unlock and wait for the post-unlock work to finish
    pub async fn unlock(&self) -> vestibule::coordinator::UnlockReport {
        self.coordinator.unlock(SECRET).await.unwrap();
        self.coordinator.wait_for_unlock_tasks().await.unwrap()
    }
}

/// Coordinator over a fresh vault in a temporary directory
pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(configure: impl FnOnce(&mut CoordinatorConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    Vault::in_dir(dir.path())
        .create(SECRET, &SEED, KdfParams::insecure_fast())
        .unwrap();

    let engine = Arc::new(MockEngine::default());
    let directory = Arc::new(MockDirectory::default());
    let proofs = Arc::new(MockProofs::default());
    let surface = Arc::new(CountingSurface::default());

    let mut config = CoordinatorConfig::new(dir.path());
    config.transport_timeout = Duration::from_secs(2);
    configure(&mut config);

    let collaborators = Collaborators {
        engine: engine.clone(),
        proofs: proofs.clone(),
        inventory: engine.clone(),
        oracle: Arc::new(MockOracle),
        transport: directory.clone(),
        surface: surface.clone(),
    };
    let coordinator = Arc::new(Coordinator::open(config, collaborators).await.unwrap());

    Harness {
        coordinator,
        engine,
        directory,
        proofs,
        surface,
        dir,
    }
}

/// Wait until `check` holds, polling for up to five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
