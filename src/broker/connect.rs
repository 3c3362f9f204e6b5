//! Connect Broker
//!
//! Grants per-origin connections against the session state.
//!
//! # Flow
//!
//! ```text
//! connect(origin)
//!   ├─ unlocked → grant, return identity
//!   └─ locked   → enqueue PendingConnect, foreground the approval surface
//!                 ├─ unlock drains the queue (FIFO)  → Ok(identity)
//!                 ├─ per-entry timer fires            → Err(ConnectTimeout)
//!                 └─ shutdown                         → Err(Cancelled)
//! ```
//!
//! Drain and timer race for the same entry. Both remove it from the queue
//! under one mutex before touching its resolver, and a resolver is a
//! `oneshot::Sender` that is consumed on use, so whichever side loses finds
//! the entry gone and does nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::services::ApprovalSurface;
use crate::session::{ActiveIdentity, SessionStore};
use crate::types::{Result, VestibuleError};

// =============================================================================
// Types
// =============================================================================

/// Permission for an origin to issue balance and signing requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionGrant {
    pub origin: String,
    pub granted_at: DateTime<Utc>,
}

/// A connect request waiting for the next unlock
pub struct PendingConnect {
    /// Broker-local sequence number (identifies the entry to its timer)
    seq: u64,
    pub origin: String,
    pub enqueued_at: DateTime<Utc>,
    resolver: oneshot::Sender<Result<ActiveIdentity>>,
}

/// Public view of a queued connect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConnectInfo {
    pub origin: String,
    pub enqueued_at: DateTime<Utc>,
}

type PendingQueue = Arc<Mutex<VecDeque<PendingConnect>>>;

/// Outcome of a connect call under the origin lock
enum Admission {
    Granted(ActiveIdentity),
    Queued(oneshot::Receiver<Result<ActiveIdentity>>),
}

// =============================================================================
// Broker
// =============================================================================

/// Grants and queues per-origin connection requests
pub struct ConnectBroker {
    /// Active grants by origin
    grants: DashMap<String, ConnectionGrant>,

    /// Connect requests waiting for unlock, in arrival order
    pending: PendingQueue,

    /// Per-origin serialization of connect/disconnect
    origin_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    next_seq: AtomicU64,

    /// How long a queued request waits for unlock
    timeout: Duration,

    surface: Arc<dyn ApprovalSurface>,

    /// Set on teardown; queued and future locked connects are cancelled
    closed: AtomicBool,
}

impl ConnectBroker {
    pub fn new(timeout: Duration, surface: Arc<dyn ApprovalSurface>) -> Self {
        Self {
            grants: DashMap::new(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            origin_locks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            timeout,
            surface,
            closed: AtomicBool::new(false),
        }
    }

    fn origin_lock(&self, origin: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.origin_locks
            .entry(origin.to_string())
            .or_default()
            .clone()
    }

    /// Give back an origin lock; the entry goes once nobody else holds it
    fn release_origin_lock(&self, origin: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.origin_locks
            .remove_if(origin, |_, held| Arc::strong_count(held) == 1);
    }

    /// Connect `origin`. Suspends while the wallet is locked.
    pub async fn connect(&self, origin: &str, sessions: &SessionStore) -> Result<ActiveIdentity> {
        if origin.trim().is_empty() {
            return Err(VestibuleError::InvalidRequest("origin must not be empty".into()));
        }

        let lock = self.origin_lock(origin);
        let guard = lock.lock().await;
        let admission = self.admit(origin, sessions);
        drop(guard);
        self.release_origin_lock(origin, lock);

        let rx = match admission? {
            Admission::Granted(identity) => return Ok(identity),
            Admission::Queued(rx) => rx,
        };

        // An unlock may have drained the queue between the check and the enqueue
        if let Some(session) = sessions.current() {
            if let Ok(identity) = ActiveIdentity::from_session(&session) {
                self.drain(&identity);
            }
        }

        self.surface.foreground().await;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(VestibuleError::Cancelled(format!(
                "connect request for {origin} dropped"
            ))),
        }
    }

    /// Grant right away when unlocked, otherwise queue. Runs under the origin lock.
    fn admit(&self, origin: &str, sessions: &SessionStore) -> Result<Admission> {
        if let Some(session) = sessions.current() {
            let identity = ActiveIdentity::from_session(&session)?;
            self.grant(origin);
            return Ok(Admission::Granted(identity));
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(VestibuleError::Cancelled("coordinator is shutting down".into()));
        }

        self.enqueue(origin).map(Admission::Queued)
    }

    /// Queue a request and arm its timeout
    fn enqueue(&self, origin: &str) -> Result<oneshot::Receiver<Result<ActiveIdentity>>> {
        let (resolver, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut queue = self
                .pending
                .lock()
                .map_err(|_| VestibuleError::Internal("connect queue poisoned".into()))?;
            queue.push_back(PendingConnect {
                seq,
                origin: origin.to_string(),
                enqueued_at: Utc::now(),
                resolver,
            });
            debug!(origin = %origin, queued = queue.len(), "Connect request queued while locked");
        }

        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&pending, seq);
        });

        Ok(rx)
    }

    /// Resolve every queued request with `identity`, oldest first.
    ///
    /// Returns the origins that were resolved, in resolution order.
    pub fn drain(&self, identity: &ActiveIdentity) -> Vec<String> {
        let drained: Vec<PendingConnect> = match self.pending.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        let mut resolved = Vec::with_capacity(drained.len());
        for entry in drained {
            // Granted before the caller can observe success, withdrawn if
            // there was no caller to receive it
            let existed = self.is_connected(&entry.origin);
            self.grant(&entry.origin);
            if entry.resolver.send(Ok(identity.clone())).is_ok() {
                resolved.push(entry.origin);
            } else {
                debug!(origin = %entry.origin, "Connect caller went away before unlock");
                if !existed {
                    self.grants.remove(&entry.origin);
                }
            }
        }

        if !resolved.is_empty() {
            info!(count = resolved.len(), "Resolved queued connect requests on unlock");
        }
        resolved
    }

    /// Cancel every queued request and refuse new locked connects
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PendingConnect> = match self.pending.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.resolver.send(Err(VestibuleError::Cancelled(
                "coordinator is shutting down".into(),
            )));
        }
        if count > 0 {
            warn!(count, "Cancelled queued connect requests on shutdown");
        }
        count
    }

    /// Remove the grant for `origin`. Idempotent; returns whether one existed.
    pub async fn disconnect(&self, origin: &str) -> bool {
        let lock = self.origin_lock(origin);
        let guard = lock.lock().await;
        let removed = self.grants.remove(origin).is_some();
        drop(guard);
        self.release_origin_lock(origin, lock);

        if removed {
            info!(origin = %origin, "Origin disconnected");
        }
        removed
    }

    /// Grant `origin`, keeping the original grant time if one exists
    pub(crate) fn grant(&self, origin: &str) -> ConnectionGrant {
        self.grants
            .entry(origin.to_string())
            .or_insert_with(|| {
                info!(origin = %origin, "Origin connected");
                ConnectionGrant {
                    origin: origin.to_string(),
                    granted_at: Utc::now(),
                }
            })
            .clone()
    }

    /// Whether `origin` holds a grant
    pub fn is_connected(&self, origin: &str) -> bool {
        self.grants.contains_key(origin)
    }

    /// `NotConnected` unless `origin` holds a grant
    pub fn require_grant(&self, origin: &str) -> Result<()> {
        if self.is_connected(origin) {
            Ok(())
        } else {
            Err(VestibuleError::NotConnected(origin.to_string()))
        }
    }

    /// All grants
    pub fn grants(&self) -> Vec<ConnectionGrant> {
        let mut grants: Vec<_> = self.grants.iter().map(|g| g.value().clone()).collect();
        grants.sort_by_key(|g| g.granted_at);
        grants
    }

    /// Queued connect requests, oldest first
    pub fn pending(&self) -> Vec<PendingConnectInfo> {
        match self.pending.lock() {
            Ok(queue) => queue
                .iter()
                .map(|p| PendingConnectInfo {
                    origin: p.origin.clone(),
                    enqueued_at: p.enqueued_at,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Timer side of the race: remove entry `seq` if it is still queued
fn expire(pending: &PendingQueue, seq: u64) {
    let entry = {
        let mut queue = match pending.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        match queue.iter().position(|p| p.seq == seq) {
            Some(index) => queue.remove(index),
            None => None,
        }
    };

    match entry {
        Some(entry) => {
            warn!(origin = %entry.origin, "Connect request timed out waiting for unlock");
            let _ = entry
                .resolver
                .send(Err(VestibuleError::ConnectTimeout(entry.origin.clone())));
        }
        None => debug!(seq, "Connect timer fired after resolution"),
    }
}

// =============================================================================
// Tests
// =============================================================================
