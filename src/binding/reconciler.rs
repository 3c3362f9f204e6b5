//! Binding Reconciler
//!
//! Checks, after every unlock, that the name the wallet has claimed still
//! points at the key the session derives today, and repairs it when it does
//! not.
//!
//! # States
//!
//! ```text
//! Unbound ──(name claimed)──▶ Verifying ──▶ Consistent
//!                                 │
//!                                 ├──▶ Drifted ──(republish ok)──▶ Consistent
//!                                 │        └────(republish failed)─ stays Drifted
//!                                 └──▶ Unreachable   (retried next unlock)
//! ```
//!
//! After a successful republish the proof-of-binding artifact is minted
//! again for the new fingerprint. A separate check, run once per derivation
//! scheme and gated by a migration flag, re-mints an artifact that was minted
//! under an older scheme even when the binding itself is consistent.
//!
//! Nothing here fails an unlock. Problems are reported in the
//! [`ReconcileReport`] and logged as warnings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::services::{BindingProofs, CollaboratorError, CollaboratorResult, MessageTransport};
use crate::signer::{fingerprint, parse_public_key, DerivedKeys, DERIVATION_SCHEME};
use crate::storage::{KvNamespace, KvStore};
use crate::types::{Result, VestibuleError};

/// Key of the claimed binding inside an address namespace
pub const BINDING_KEY: &str = "name-binding";

/// Migration flag gating the one-time proof re-mint for the current scheme
pub fn proof_scheme_flag() -> String {
    format!("binding-proof-scheme-v{DERIVATION_SCHEME}")
}

// =============================================================================
// Types
// =============================================================================

/// A claimed name and the fingerprint it was last seen bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBinding {
    pub name: String,
    /// Fingerprint of the key the published binding points at
    pub bound_key_fingerprint: String,
    /// Last time the published binding matched the session key
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Unbound,
    Verifying,
    Consistent,
    Drifted,
    Unreachable,
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub state: BindingState,
    /// Published binding differed from the session key
    pub drift_detected: bool,
    /// Binding was republished under the session key
    pub republished: bool,
    /// A proof artifact was minted this pass
    pub proof_regenerated: bool,
    /// Proof minting failed; binding is usable but uncertified
    pub proof_degraded: Option<String>,
}

impl ReconcileReport {
    fn new(state: BindingState) -> Self {
        Self {
            state,
            drift_detected: false,
            republished: false,
            proof_regenerated: false,
            proof_degraded: None,
        }
    }

    /// The non-fatal condition this pass ended in, if any
    pub fn warning(&self, name: &str) -> Option<VestibuleError> {
        match self.state {
            BindingState::Drifted => Some(VestibuleError::BindingDrifted(name.to_string())),
            BindingState::Unreachable => {
                Some(VestibuleError::BindingUnreachable(name.to_string()))
            }
            _ => None,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct BindingReconciler {
    transport: Arc<dyn MessageTransport>,
    proofs: Arc<dyn BindingProofs>,

    /// Flag storage for the one-time scheme check
    kv: KvStore,

    state: watch::Sender<BindingState>,

    /// Bound on every transport call
    transport_timeout: Duration,

    /// One pass at a time
    running: Mutex<()>,
}

impl BindingReconciler {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        proofs: Arc<dyn BindingProofs>,
        kv: KvStore,
        transport_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(BindingState::Unbound);
        Self {
            transport,
            proofs,
            kv,
            state,
            transport_timeout,
            running: Mutex::new(()),
        }
    }

    pub fn state(&self) -> BindingState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BindingState) {
        self.state.send_replace(state);
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = CollaboratorResult<T>>,
    ) -> CollaboratorResult<T> {
        match tokio::time::timeout(self.transport_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(format!(
                "no answer within {:?}",
                self.transport_timeout
            ))),
        }
    }

    /// The claimed binding in `namespace`, if any
    pub fn binding(&self, namespace: &KvNamespace) -> Result<Option<NameBinding>> {
        namespace.get(BINDING_KEY)
    }

    /// Record a claim on `name`; the next reconcile publishes it
    pub fn claim(&self, namespace: &KvNamespace, name: &str) -> Result<NameBinding> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VestibuleError::InvalidRequest("name must not be empty".into()));
        }
        let binding = NameBinding {
            name: name.to_string(),
            bound_key_fingerprint: String::new(),
            verified_at: None,
        };
        namespace.put(BINDING_KEY, &binding)?;
        info!(name = %name, "Name claimed");
        Ok(binding)
    }

    /// Resolve `name` through the transport
    pub async fn resolve(&self, name: &str) -> Result<Option<String>> {
        self.bounded(self.transport.resolve_name(name))
            .await
            .map_err(|e| VestibuleError::BindingUnreachable(format!("{name}: {e}")))
    }

    /// Bring the claimed binding in `namespace` in line with `keys`
    pub async fn reconcile(&self, keys: &DerivedKeys, namespace: &KvNamespace) -> ReconcileReport {
        let _pass = self.running.lock().await;

        let mut binding = match self.binding(namespace) {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                self.set_state(BindingState::Unbound);
                return ReconcileReport::new(BindingState::Unbound);
            }
            Err(e) => {
                warn!(error = %e, "Could not read claimed binding");
                self.set_state(BindingState::Unreachable);
                return ReconcileReport::new(BindingState::Unreachable);
            }
        };

        self.set_state(BindingState::Verifying);
        let current = keys.fingerprint();

        let published = match self.bounded(self.transport.resolve_name(&binding.name)).await {
            Ok(published) => published,
            Err(e) => {
                warn!(name = %binding.name, error = %e, "Name directory unreachable");
                self.set_state(BindingState::Unreachable);
                return ReconcileReport::new(BindingState::Unreachable);
            }
        };

        let published_fingerprint = published
            .as_deref()
            .and_then(|key| parse_public_key(key).ok())
            .map(|key| fingerprint(&key));

        let mut report = ReconcileReport::new(BindingState::Consistent);

        if published_fingerprint.as_deref() != Some(current.as_str()) {
            report.drift_detected = true;
            self.set_state(BindingState::Drifted);
            info!(
                name = %binding.name,
                published = ?published_fingerprint,
                current = %current,
                "Name binding drifted, republishing"
            );

            match self
                .bounded(self.transport.publish_binding(&binding.name, &keys.public_key_hex()))
                .await
            {
                Ok(true) => report.republished = true,
                Ok(false) => {
                    warn!(name = %binding.name, "Directory refused republished binding");
                    report.state = BindingState::Drifted;
                    return report;
                }
                Err(e) => {
                    warn!(name = %binding.name, error = %e, "Republishing binding failed");
                    report.state = BindingState::Drifted;
                    return report;
                }
            }

            match self
                .bounded(self.proofs.regenerate_binding_proof(
                    &binding.name,
                    &current,
                    DERIVATION_SCHEME,
                ))
                .await
            {
                Ok(_) => report.proof_regenerated = true,
                Err(e) => {
                    warn!(name = %binding.name, error = %e, "Proof regeneration failed, binding degraded");
                    report.proof_degraded = Some(e.to_string());
                }
            }
        }

        binding.bound_key_fingerprint = current.clone();
        binding.verified_at = Some(Utc::now());
        if let Err(e) = namespace.put(BINDING_KEY, &binding) {
            warn!(name = %binding.name, error = %e, "Could not record verified binding");
        }

        self.check_proof_scheme(&binding.name, &current, &mut report).await;

        self.set_state(BindingState::Consistent);
        debug!(name = %binding.name, ?report, "Binding reconciled");
        report
    }

    /// One-time re-mint of an artifact minted under an older scheme
    async fn check_proof_scheme(&self, name: &str, current: &str, report: &mut ReconcileReport) {
        let flag = proof_scheme_flag();
        match self.kv.flag(&flag) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Could not read proof scheme flag");
                return;
            }
        }

        let needs_remint = if report.proof_regenerated {
            false
        } else {
            match self.bounded(self.proofs.binding_proof(name)).await {
                Ok(Some(artifact)) => artifact.derivation_scheme < DERIVATION_SCHEME,
                Ok(None) => false,
                Err(e) => {
                    warn!(name = %name, error = %e, "Could not inspect proof artifact");
                    return;
                }
            }
        };

        if needs_remint {
            info!(name = %name, scheme = DERIVATION_SCHEME, "Re-minting proof from older derivation scheme");
            match self
                .bounded(self.proofs.regenerate_binding_proof(name, current, DERIVATION_SCHEME))
                .await
            {
                Ok(_) => report.proof_regenerated = true,
                Err(e) => {
                    warn!(name = %name, error = %e, "Scheme re-mint failed, will retry next unlock");
                    report.proof_degraded = Some(e.to_string());
                    return;
                }
            }
        }

        if let Err(e) = self.kv.set_flag(&flag) {
            warn!(error = %e, "Could not record proof scheme flag");
        }
    }
}
