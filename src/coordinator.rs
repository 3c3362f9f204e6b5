//! Coordinator
//!
//! Owns the one session handle and every component that consults it, and
//! dispatches inbound messages to them.
//!
//! # Unlock
//!
//! ```text
//! unlock(secret)
//!   ├─ SessionStore::unlock          (Auth on a bad secret)
//!   ├─ ConnectBroker::drain          (queued connects resolve, FIFO)
//!   └─ spawn post-unlock work        (never fails the unlock)
//!        ├─ transport.connect(secondary key)
//!        ├─ StorageMigrator::run_once(Legacy → Bech32)
//!        ├─ record canonical identity under the current address
//!        └─ BindingReconciler::reconcile
//! ```
//!
//! # Approval
//!
//! ```text
//! approve(id)
//!   ├─ session required               (Locked: entry stays queued)
//!   ├─ queue.take(id)                 (NotFound on a second approval)
//!   ├─ journal: Reserved → Executing
//!   ├─ execute effect
//!   ├─ journal: Settled | Failed      (Failed → ApprovedButFailed)
//!   └─ route result to source context
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::approval::{
    execute, ApprovalJournal, ApprovalPhase, ApprovalRouter, EnvelopeReceiver, EnvelopeSender,
    JournalEntry, PendingTransaction, QueueEvent, TransactionKind, TransactionQueue,
};
use crate::binding::{BindingReconciler, BindingState, NameBinding, ReconcileReport};
use crate::broker::ConnectBroker;
use crate::config::CoordinatorConfig;
use crate::logging::{AuditEvent, AuditEventType, AuditLogger};
use crate::protocol::{InboundMessage, Request, ResultEnvelope};
use crate::services::{check_tokens, Collaborators, MessageTransport, TokenHealthReport};
use crate::session::{ActiveIdentity, Session, SessionStore, Vault};
use crate::signer::DerivedKeys;
use crate::storage::{
    AddressForm, KvNamespace, KvStore, MigrationReport, ObjectDb, ObjectStore, StorageMigrator,
    CANONICAL_KEY,
};
use crate::types::{Result, VestibuleError};

// =============================================================================
// Types
// =============================================================================

/// Canonical record written under the current address namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Hex of the compressed identity key
    pub identity_key: String,
    pub address: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// What the post-unlock work did
#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub address: String,
    pub transport_connected: bool,
    /// `None` when the migration had already run
    pub migration: Option<MigrationReport>,
    pub reconcile: Option<ReconcileReport>,
    /// Non-fatal problems, as error strings
    pub warnings: Vec<String>,
}

// =============================================================================
// Post-unlock work
// =============================================================================

/// Everything the post-unlock task needs, detached from the coordinator
struct UnlockWork {
    kv: KvStore,
    migrator: StorageMigrator,
    reconciler: Arc<BindingReconciler>,
    transport: Arc<dyn MessageTransport>,
    transport_timeout: Duration,
}

impl UnlockWork {
    async fn run(self, identity_key: [u8; 33], keys: DerivedKeys, address: String) -> UnlockReport {
        let mut report = UnlockReport {
            address: address.clone(),
            transport_connected: false,
            migration: None,
            reconcile: None,
            warnings: Vec::new(),
        };

        // 1. Secondary transport
        match tokio::time::timeout(
            self.transport_timeout,
            self.transport.connect(&keys.public_key_hex()),
        )
        .await
        {
            Ok(Ok(())) => report.transport_connected = true,
            Ok(Err(e)) => {
                warn!(error = %e, "Transport connect failed");
                report.warnings.push(e.to_string());
            }
            Err(_) => {
                warn!("Transport connect timed out");
                report.warnings.push("transport connect timed out".into());
            }
        }

        // 2. One-time storage migration into the current address form
        let migrated = match self.migrate(&identity_key, &address).await {
            Ok(migration) => {
                report.migration = migration;
                true
            }
            Err(e) => {
                warn!(error = %e, "Storage migration incomplete, retrying next unlock");
                report.warnings.push(e.to_string());
                false
            }
        };

        // 3. Canonical key, only once the namespace is known complete
        let namespace = self.kv.namespace(&address);
        if migrated {
            if let Err(e) = record_identity(&namespace, &identity_key, &address) {
                warn!(error = %e, "Could not record canonical identity");
                report.warnings.push(e.to_string());
            }
        }

        // 4. Name binding
        let reconcile = self.reconciler.reconcile(&keys, &namespace).await;
        if let Some(name) = self
            .reconciler
            .binding(&namespace)
            .ok()
            .flatten()
            .map(|b| b.name)
        {
            if let Some(warning) = reconcile.warning(&name) {
                report.warnings.push(warning.to_string());
            }
        }
        report.reconcile = Some(reconcile);

        info!(
            address = %address,
            warnings = report.warnings.len(),
            "Post-unlock work complete"
        );
        report
    }

    async fn migrate(
        &self,
        identity_key: &[u8; 33],
        address: &str,
    ) -> Result<Option<MigrationReport>> {
        let current = AddressForm::CURRENT;
        let Some(previous) = current.previous() else {
            return Ok(None);
        };
        let old_address = previous.encode(identity_key)?;
        let new_address = address.to_string();
        let migration_id = current.migration_id();
        let migrator = self.migrator.clone();

        tokio::task::spawn_blocking(move || {
            migrator.run_once(&migration_id, &old_address, &new_address)
        })
        .await
        .map_err(|e| VestibuleError::MigrationPartial(format!("migration task failed: {e}")))?
    }
}

fn approved_but_failed(request_id: &str, reason: String) -> VestibuleError {
    VestibuleError::ApprovedButFailed {
        request_id: request_id.to_string(),
        reason,
    }
}

fn record_identity(namespace: &KvNamespace, identity_key: &[u8; 33], address: &str) -> Result<()> {
    if namespace.contains(CANONICAL_KEY)? {
        return Ok(());
    }
    namespace.put(
        CANONICAL_KEY,
        &IdentityRecord {
            identity_key: hex::encode(identity_key),
            address: address.to_string(),
            recorded_at: chrono::Utc::now(),
        },
    )?;
    debug!(address = %address, "Recorded canonical identity");
    Ok(())
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    config: CoordinatorConfig,
    sessions: Arc<SessionStore>,
    broker: ConnectBroker,
    queue: TransactionQueue,
    journal: ApprovalJournal,
    router: ApprovalRouter,
    reconciler: Arc<BindingReconciler>,
    kv: KvStore,
    objects: Arc<ObjectStore>,
    migrator: StorageMigrator,
    collaborators: Collaborators,
    audit: AuditLogger,

    /// Journal entries a previous run left unfinished
    interrupted: Vec<JournalEntry>,

    /// Post-unlock work of the most recent unlock
    unlock_task: Mutex<Option<JoinHandle<UnlockReport>>>,

    auto_lock: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Open the stores under `config.data_dir` and recover the journal
    pub async fn open(config: CoordinatorConfig, collaborators: Collaborators) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let sessions = Arc::new(SessionStore::new(Vault::in_dir(&config.data_dir)));
        let db = sled::open(config.store_path())?;
        let kv = KvStore::with_db(db.clone())?;
        let journal = ApprovalJournal::open(&db)?;
        let objects = Arc::new(ObjectStore::new(config.objects_path()));
        let migrator = StorageMigrator::new(kv.clone(), Arc::clone(&objects));

        let broker = ConnectBroker::new(config.connect_timeout, Arc::clone(&collaborators.surface));
        let reconciler = Arc::new(BindingReconciler::new(
            Arc::clone(&collaborators.transport),
            Arc::clone(&collaborators.proofs),
            kv.clone(),
            config.transport_timeout,
        ));

        let interrupted = journal.recover()?;
        let pruned = journal.prune(config.journal_retention)?;

        let auto_lock = config
            .auto_lock
            .map(|idle| sessions.spawn_auto_lock(idle));

        info!(
            data_dir = %config.data_dir.display(),
            interrupted = interrupted.len(),
            pruned,
            "Coordinator opened"
        );

        Ok(Self {
            config,
            sessions,
            broker,
            queue: TransactionQueue::new(),
            journal,
            router: ApprovalRouter::new(),
            reconciler,
            kv,
            objects,
            migrator,
            collaborators,
            audit: AuditLogger::new(),
            interrupted,
            unlock_task: Mutex::new(None),
            auto_lock: std::sync::Mutex::new(auto_lock),
        })
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn broker(&self) -> &ConnectBroker {
        &self.broker
    }

    pub fn router(&self) -> &ApprovalRouter {
        &self.router
    }

    pub fn journal(&self) -> &ApprovalJournal {
        &self.journal
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Approvals a previous run left unfinished, closed as failed at startup
    pub fn interrupted(&self) -> &[JournalEntry] {
        &self.interrupted
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    /// Unlock, resolve queued connects and start the post-unlock work
    pub async fn unlock(&self, secret: &str) -> Result<ActiveIdentity> {
        let session = match self.sessions.unlock(secret).await {
            Ok(session) => session,
            Err(e) => {
                self.audit
                    .log(AuditEvent::new(AuditEventType::Unlocked).with_detail(json!({ "success": false })))
                    .await;
                return Err(e);
            }
        };
        let identity = ActiveIdentity::from_session(&session)?;
        self.audit
            .log(AuditEvent::new(AuditEventType::Unlocked).with_detail(json!({ "success": true })))
            .await;

        // Waiting connect callers record their own grants
        let resolved = self.broker.drain(&identity);
        debug!(resolved = resolved.len(), "Drained queued connects");

        let work = UnlockWork {
            kv: self.kv.clone(),
            migrator: self.migrator.clone(),
            reconciler: Arc::clone(&self.reconciler),
            transport: Arc::clone(&self.collaborators.transport),
            transport_timeout: self.config.transport_timeout,
        };
        let keys = session.derived_keys()?;
        let handle = tokio::spawn(work.run(*session.identity_key(), keys, identity.address.clone()));

        if let Some(previous) = self.unlock_task.lock().await.replace(handle) {
            debug!(finished = previous.is_finished(), "Replaced earlier post-unlock task");
        }

        Ok(identity)
    }

    /// Await the post-unlock work of the latest unlock, if any is pending
    pub async fn wait_for_unlock_tasks(&self) -> Option<UnlockReport> {
        let handle = self.unlock_task.lock().await.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Post-unlock task failed");
                None
            }
        }
    }

    /// Lock and wipe the session. Queued requests stay queued.
    pub async fn lock(&self) -> bool {
        let was_unlocked = self.sessions.lock().await;
        if was_unlocked {
            self.audit.log(AuditEvent::new(AuditEventType::Locked)).await;
        }
        was_unlocked
    }

    pub fn is_unlocked(&self) -> bool {
        self.sessions.is_unlocked()
    }

    /// Current address namespace
    fn namespace(&self, session: &Session) -> Result<KvNamespace> {
        let address = AddressForm::CURRENT.encode(session.identity_key())?;
        Ok(self.kv.namespace(&address))
    }

    /// Object database of the unlocked wallet (fresh after any migration)
    pub fn object_db(&self) -> Result<ObjectDb> {
        let session = self.sessions.require()?;
        let address = AddressForm::CURRENT.encode(session.identity_key())?;
        self.objects.open(&address)
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    pub async fn connect(&self, origin: &str) -> Result<ActiveIdentity> {
        let identity = self.broker.connect(origin, &self.sessions).await?;
        self.audit.log_grant(origin).await;
        Ok(identity)
    }

    pub async fn disconnect(&self, origin: &str) -> bool {
        let removed = self.broker.disconnect(origin).await;
        if removed {
            self.audit.log_revoke(origin).await;
        }
        removed
    }

    /// Identity for a connected origin
    pub fn active_identity(&self, origin: &str) -> Result<ActiveIdentity> {
        self.broker.require_grant(origin)?;
        let session = self.sessions.require()?;
        ActiveIdentity::from_session(&session)
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Queue an action request and foreground the approval surface
    pub async fn submit(
        &self,
        kind: TransactionKind,
        origin: &str,
        source_context: &str,
        correlation_id: &str,
        payload: Value,
    ) -> Result<String> {
        let request_id = self.queue.submit(
            kind,
            origin,
            source_context,
            correlation_id,
            payload,
            &self.broker,
            &self.sessions,
        )?;
        self.collaborators.surface.foreground().await;
        Ok(request_id)
    }

    /// Pending requests in enqueue order
    pub fn list(&self) -> Vec<PendingTransaction> {
        self.queue.list()
    }

    /// Push feed of queue changes
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Approve `request_id`: take it off the queue, run it, route the outcome
    pub async fn approve(&self, request_id: &str) -> Result<Value> {
        let session = self.sessions.require()?;
        let transaction = self.queue.take(request_id)?;
        self.audit
            .log_request(AuditEventType::Approved, &transaction.origin, request_id)
            .await;

        let outcome = self.settle(&transaction, &session).await;

        let envelope = match &outcome {
            Ok(value) => ResultEnvelope::ok(&transaction.correlation_id, value.clone()),
            Err(e) => ResultEnvelope::err(&transaction.correlation_id, e),
        };
        self.router.route(&transaction.source_context, envelope);
        self.queue.finish(&transaction);

        outcome.map(|result| json!({ "request_id": request_id, "result": result }))
    }

    /// Journal and execute a transaction already taken off the queue
    async fn settle(&self, transaction: &PendingTransaction, session: &Session) -> Result<Value> {
        let request_id = transaction.request_id.as_str();

        if let Err(e) = self.journal.reserve(transaction) {
            warn!(request_id = %request_id, error = %e, "Could not journal approval, not executing");
            self.audit
                .log_failure(&transaction.origin, request_id, &e.to_string())
                .await;
            return Err(approved_but_failed(request_id, e.to_string()));
        }
        if let Err(e) = self.journal.advance(request_id, ApprovalPhase::Executing, None) {
            warn!(request_id = %request_id, error = %e, "Could not mark approval executing");
        }

        match execute(transaction, session, self.collaborators.engine.as_ref()).await {
            Ok(value) => {
                let reference = value
                    .get("transfer_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Err(e) = self.journal.advance(request_id, ApprovalPhase::Settled, reference) {
                    warn!(request_id = %request_id, error = %e, "Could not mark approval settled");
                }
                self.audit
                    .log_request(AuditEventType::Settled, &transaction.origin, request_id)
                    .await;
                info!(request_id = %request_id, kind = %transaction.kind, "Approved request settled");
                Ok(value)
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(je) =
                    self.journal
                        .advance(request_id, ApprovalPhase::Failed, Some(reason.clone()))
                {
                    warn!(request_id = %request_id, error = %je, "Could not mark approval failed");
                }
                self.audit
                    .log_failure(&transaction.origin, request_id, &reason)
                    .await;
                warn!(request_id = %request_id, error = %reason, "Approved request failed");
                Err(approved_but_failed(request_id, reason))
            }
        }
    }

    /// Reject `request_id` and tell its requester
    pub async fn reject(&self, request_id: &str) -> Result<()> {
        let transaction = self.queue.take(request_id)?;
        self.router.route(
            &transaction.source_context,
            ResultEnvelope::rejected(&transaction.correlation_id),
        );
        self.queue.finish(&transaction);
        self.audit
            .log_request(AuditEventType::Rejected, &transaction.origin, request_id)
            .await;
        info!(request_id = %request_id, "Request rejected");
        Ok(())
    }

    /// Register a context to receive routed results
    pub fn register_context(&self, context_id: &str) -> EnvelopeReceiver {
        self.router.register(context_id)
    }

    /// Route `context_id` into a shared outbound stream
    pub fn attach_context(&self, context_id: &str, sender: EnvelopeSender) {
        self.router.attach(context_id, sender);
    }

    // -------------------------------------------------------------------------
    // Names and tokens
    // -------------------------------------------------------------------------

    pub fn binding_state(&self) -> BindingState {
        self.reconciler.state()
    }

    /// Claimed binding of the unlocked wallet
    pub fn name_binding(&self) -> Result<Option<NameBinding>> {
        let session = self.sessions.require()?;
        self.reconciler.binding(&self.namespace(&session)?)
    }

    /// Claim `name` for the unlocked wallet and reconcile it now
    pub async fn claim_name(&self, name: &str) -> Result<ReconcileReport> {
        let session = self.sessions.require()?;
        let keys = session.derived_keys()?;
        let namespace = self.namespace(&session)?;

        if let Some(bound) = self.reconciler.resolve(name).await? {
            let ours = crate::signer::parse_public_key(&bound)
                .map(|key| key == keys.public_key)
                .unwrap_or(false);
            if !ours {
                return Err(VestibuleError::InvalidRequest(format!("name {name} is taken")));
            }
        }

        self.reconciler.claim(&namespace, name)?;
        Ok(self.reconciler.reconcile(&keys, &namespace).await)
    }

    pub async fn resolve_name(&self, name: &str) -> Result<Option<String>> {
        self.reconciler.resolve(name).await
    }

    /// Accept an incoming transfer payload
    pub async fn receive(&self, payload: &str) -> Result<Value> {
        self.sessions.require()?;
        let outcome = self.collaborators.engine.receive(payload).await?;
        Ok(serde_json::to_value(outcome)?)
    }

    /// Out-of-band token health check
    pub async fn token_health(&self) -> Result<TokenHealthReport> {
        check_tokens(
            self.collaborators.inventory.as_ref(),
            self.collaborators.oracle.as_ref(),
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Handle one inbound message.
    ///
    /// Returns `None` for action requests that were queued; their answer is
    /// routed to the source context once the user decides.
    pub async fn handle(&self, message: InboundMessage) -> Option<ResultEnvelope> {
        self.sessions.touch();
        let correlation_id = message.correlation_id.clone();
        debug!(
            request = message.request.name(),
            correlation_id = %correlation_id,
            origin = ?message.origin,
            "Inbound message"
        );

        if !message.request.is_page_request() && !self.from_surface(&message) {
            warn!(
                request = message.request.name(),
                context = %message.context(),
                origin = ?message.origin,
                "Refused surface command from a page"
            );
            return Some(ResultEnvelope::err(
                correlation_id,
                &VestibuleError::InvalidRequest(format!(
                    "{} is only accepted from the approval surface",
                    message.request.name()
                )),
            ));
        }

        let origin = match (&message.origin, message.request.is_page_request()) {
            (Some(origin), _) => origin.clone(),
            (None, false) => String::new(),
            (None, true) => {
                return Some(ResultEnvelope::err(
                    correlation_id,
                    &VestibuleError::InvalidRequest("page requests must carry an origin".into()),
                ))
            }
        };
        let context = message.context().to_string();

        let result: Result<Value> = match &message.request {
            Request::Connect => self
                .connect(&origin)
                .await
                .and_then(|identity| Ok(serde_json::to_value(identity)?)),
            Request::Disconnect => Ok(json!({ "disconnected": self.disconnect(&origin).await })),
            Request::GetActiveIdentity => self
                .active_identity(&origin)
                .and_then(|identity| Ok(serde_json::to_value(identity)?)),
            Request::GetBalances => self.balances(&origin).await,

            Request::SendTokens(payload) => {
                return self
                    .queue_action(
                        TransactionKind::Send,
                        &origin,
                        &context,
                        &correlation_id,
                        serde_json::to_value(payload),
                    )
                    .await;
            }
            Request::SignMessage(payload) => {
                return self
                    .queue_action(
                        TransactionKind::SignMessage,
                        &origin,
                        &context,
                        &correlation_id,
                        serde_json::to_value(payload),
                    )
                    .await;
            }
            Request::SignProtocolEvent { event } => {
                return self
                    .queue_action(
                        TransactionKind::SignProtocolEvent,
                        &origin,
                        &context,
                        &correlation_id,
                        serde_json::to_value(event),
                    )
                    .await;
            }

            Request::ResolveName { name } => self
                .resolve_name(name)
                .await
                .map(|key| json!({ "name": name, "public_key": key })),
            Request::CheckNameAvailable { name } => self
                .resolve_name(name)
                .await
                .map(|key| json!({ "name": name, "available": key.is_none() })),
            Request::GetNameBinding => self.broker.require_grant(&origin).and_then(|_| {
                Ok(json!({
                    "binding": self.name_binding()?,
                    "state": self.binding_state(),
                }))
            }),

            Request::Unlock { secret } => self
                .unlock(secret)
                .await
                .and_then(|identity| Ok(serde_json::to_value(identity)?)),
            Request::Lock => Ok(json!({ "was_unlocked": self.lock().await })),
            Request::ListPending => Ok(json!({ "pending": self.list() })),
            Request::Approve { request_id } => self.approve(request_id).await,
            Request::Reject { request_id } => self
                .reject(request_id)
                .await
                .map(|_| json!({ "request_id": request_id, "rejected": true })),
            Request::ClaimName { name } => self
                .claim_name(name)
                .await
                .and_then(|report| Ok(serde_json::to_value(report)?)),
            Request::ReceiveTokens { payload } => self.receive(payload).await,
            Request::TokenHealth => self
                .token_health()
                .await
                .and_then(|report| Ok(serde_json::to_value(report)?)),
        };

        Some(ResultEnvelope::from_result(correlation_id, result))
    }

    /// Surface commands carry no origin and arrive on the surface context
    fn from_surface(&self, message: &InboundMessage) -> bool {
        message.origin.is_none() && message.context() == self.config.surface_context
    }

    /// Queue an action; only a refusal is answered right away
    async fn queue_action(
        &self,
        kind: TransactionKind,
        origin: &str,
        context: &str,
        correlation_id: &str,
        payload: serde_json::Result<Value>,
    ) -> Option<ResultEnvelope> {
        let result = match payload {
            Ok(payload) => {
                self.submit(kind, origin, context, correlation_id, payload)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        result.err().map(|e| ResultEnvelope::err(correlation_id, &e))
    }

    async fn balances(&self, origin: &str) -> Result<Value> {
        self.broker.require_grant(origin)?;
        self.sessions.require()?;
        let balances = self.collaborators.engine.get_balances().await?;
        Ok(json!({ "balances": balances }))
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Cancel queued connects, drop queued transactions and lock
    pub async fn shutdown(&self) {
        let cancelled = self.broker.shutdown();
        let dropped = self.queue.clear();

        if let Ok(mut auto_lock) = self.auto_lock.lock() {
            if let Some(handle) = auto_lock.take() {
                handle.abort();
            }
        }
        if let Some(handle) = self.unlock_task.lock().await.take() {
            let _ = handle.await;
        }
        self.lock().await;

        if let Err(e) = self.kv.flush() {
            warn!(error = %e, "Flush on shutdown failed");
        }
        info!(cancelled, dropped, "Coordinator shut down");
    }
}
