//! Session Store
//!
//! Single-writer slot holding the unlocked signing session. Readers see
//! either fully locked or fully unlocked: the slot is swapped in one step and
//! a session is only published once it is complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::vault::Vault;
use crate::signer::keys::{derive, identity_public_key, DerivedKeys, IDENTITY_KEY_LEN, SEED_LEN};
use crate::types::{now_millis, Result, VestibuleError};

// =============================================================================
// Session
// =============================================================================

/// The unlocked signing session.
///
/// Secret material is zeroized when the session is locked or dropped,
/// whichever comes first. Holders of an `Arc<Session>` that outlive a lock
/// observe `Locked` from [`Session::derived_keys`].
pub struct Session {
    /// Identity seed (sensitive!), `None` once wiped
    identity_seed: Mutex<Option<Zeroizing<[u8; SEED_LEN]>>>,

    /// Compressed identity public key
    identity_key: [u8; IDENTITY_KEY_LEN],

    /// When the session was unlocked
    pub unlocked_at: DateTime<Utc>,
}

impl Session {
    /// Build a session from a decrypted seed
    pub fn new(identity_seed: Zeroizing<[u8; SEED_LEN]>) -> Result<Self> {
        let identity_key = identity_public_key(identity_seed.as_slice())?;
        Ok(Self {
            identity_seed: Mutex::new(Some(identity_seed)),
            identity_key,
            unlocked_at: Utc::now(),
        })
    }

    /// Compressed identity public key
    pub fn identity_key(&self) -> &[u8; IDENTITY_KEY_LEN] {
        &self.identity_key
    }

    /// Recompute the secondary keys from the live seed
    pub fn derived_keys(&self) -> Result<DerivedKeys> {
        let guard = self
            .identity_seed
            .lock()
            .map_err(|_| VestibuleError::Internal("session mutex poisoned".into()))?;
        match guard.as_ref() {
            Some(seed) => derive(seed.as_slice()),
            None => Err(VestibuleError::Locked),
        }
    }

    /// Whether secret material is still present
    pub fn is_live(&self) -> bool {
        self.identity_seed
            .lock()
            .map(|seed| seed.is_some())
            .unwrap_or(false)
    }

    /// Drop the seed; `Zeroizing` clears it
    fn wipe(&self) {
        match self.identity_seed.lock() {
            Ok(mut seed) => {
                seed.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity_key", &hex::encode(self.identity_key))
            .field("unlocked_at", &self.unlocked_at)
            .field("live", &self.is_live())
            .finish()
    }
}

// =============================================================================
// Session Store
// =============================================================================

/// Owner of the one process-wide session slot
pub struct SessionStore {
    /// Vault holding the encrypted seed
    vault: Vault,

    /// The slot. `send_replace` is the only way it changes.
    slot: watch::Sender<Option<Arc<Session>>>,

    /// Serializes lock and unlock transitions
    transition: tokio::sync::Mutex<()>,

    /// Last activity (unix millis), for idle auto-lock
    last_activity: AtomicU64,
}

impl SessionStore {
    /// Create a locked store backed by `vault`
    pub fn new(vault: Vault) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            vault,
            slot,
            transition: tokio::sync::Mutex::new(()),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    /// Vault backing this store
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Decrypt the vault with `secret` and publish a new session.
    ///
    /// Fails with `Auth` on a wrong or missing credential; the store stays
    /// in whatever state it was in.
    pub async fn unlock(&self, secret: &str) -> Result<Arc<Session>> {
        let _transition = self.transition.lock().await;

        let vault = self.vault.clone();
        let secret = Zeroizing::new(secret.to_string());
        let seed = tokio::task::spawn_blocking(move || vault.open(&secret))
            .await
            .map_err(|e| VestibuleError::Internal(format!("unlock task failed: {e}")))??;

        let session = Arc::new(Session::new(seed)?);
        if let Some(previous) = self.slot.send_replace(Some(Arc::clone(&session))) {
            previous.wipe();
        }
        self.touch();

        info!(
            identity_key = %hex::encode(session.identity_key()),
            "Session unlocked"
        );
        Ok(session)
    }

    /// Clear the session and wipe its material. Returns whether it was unlocked.
    ///
    /// Waits for an unlock already in progress, so a lock issued during one
    /// still leaves the store locked.
    pub async fn lock(&self) -> bool {
        let _transition = self.transition.lock().await;
        match self.slot.send_replace(None) {
            Some(previous) => {
                previous.wipe();
                info!("Session locked");
                true
            }
            None => false,
        }
    }

    /// Pure read of the slot
    pub fn is_unlocked(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Current session, if unlocked
    pub fn current(&self) -> Option<Arc<Session>> {
        self.slot.borrow().clone()
    }

    /// Current session or `Locked`
    pub fn require(&self) -> Result<Arc<Session>> {
        self.current().ok_or(VestibuleError::Locked)
    }

    /// Watch lock/unlock transitions
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Session>>> {
        self.slot.subscribe()
    }

    /// Record activity (resets the idle timer)
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Spawn a task that locks the session after `idle` without activity.
    pub fn spawn_auto_lock(self: &Arc<Self>, idle: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let check_every = (idle / 4).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                ticker.tick().await;
                if store.is_unlocked() && store.idle_for() >= idle {
                    warn!(idle_secs = idle.as_secs(), "Auto-locking idle session");
                    store.lock().await;
                } else {
                    debug!("Auto-lock check: session active or locked");
                }
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
