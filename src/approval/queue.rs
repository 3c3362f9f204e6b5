//! Transaction Queue
//!
//! Holds action requests until the approval surface decides on them.
//!
//! Entries leave the queue exactly once, through [`TransactionQueue::take`].
//! Approval takes the entry out *before* its effect runs, so a second
//! approval of the same id finds nothing and reports `NotFound`. Distinct
//! ids are never serialized against each other.
//!
//! A requester's `(source_context, correlation_id)` pair names at most one
//! request at a time, from submission until [`TransactionQueue::finish`] is
//! called once its single answer has been routed.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::ConnectBroker;
use crate::session::SessionStore;
use crate::signer::UnsignedEvent;
use crate::types::{Result, VestibuleError};

/// Capacity of the change feed; slow subscribers see `Lagged` and re-list
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Types
// =============================================================================

/// Kind of action awaiting approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Send,
    SignMessage,
    SignProtocolEvent,
}

impl TransactionKind {
    /// Whether the action moves funds
    pub fn affects_balance(self) -> bool {
        matches!(self, Self::Send)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::SignMessage => "sign_message",
            Self::SignProtocolEvent => "sign_protocol_event",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPayload {
    pub coin_id: String,
    pub amount: u64,
    pub recipient: String,
}

/// Message signature request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignMessagePayload {
    /// UTF-8 message, or hex of a 32-byte hash when `prehashed`
    pub message: String,
    #[serde(default)]
    pub prehashed: bool,
}

/// Kind-specific request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionPayload {
    Send(SendPayload),
    SignMessage(SignMessagePayload),
    SignProtocolEvent(UnsignedEvent),
}

impl TransactionPayload {
    /// Parse a raw payload as `kind`
    pub fn parse(kind: TransactionKind, raw: serde_json::Value) -> Result<Self> {
        let payload = match kind {
            TransactionKind::Send => Self::Send(serde_json::from_value(raw)?),
            TransactionKind::SignMessage => Self::SignMessage(serde_json::from_value(raw)?),
            TransactionKind::SignProtocolEvent => {
                Self::SignProtocolEvent(serde_json::from_value(raw)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> TransactionKind {
        match self {
            Self::Send(_) => TransactionKind::Send,
            Self::SignMessage(_) => TransactionKind::SignMessage,
            Self::SignProtocolEvent(_) => TransactionKind::SignProtocolEvent,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Send(send) => {
                if send.amount == 0 {
                    return Err(VestibuleError::InvalidRequest("amount must be positive".into()));
                }
                if send.coin_id.is_empty() || send.recipient.is_empty() {
                    return Err(VestibuleError::InvalidRequest(
                        "coin_id and recipient are required".into(),
                    ));
                }
            }
            Self::SignMessage(sign) if sign.prehashed => {
                let hash = hex::decode(&sign.message).map_err(|e| {
                    VestibuleError::InvalidRequest(format!("prehashed message is not hex: {e}"))
                })?;
                if hash.len() != 32 {
                    return Err(VestibuleError::InputSize {
                        expected: 32,
                        actual: hash.len(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// An action request awaiting approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Unique id, also the correlation id of the eventual result
    pub request_id: String,
    pub kind: TransactionKind,
    pub origin: String,
    /// Context the result is routed back to
    pub source_context: String,
    /// Requester's own id for the request, echoed on the result
    pub correlation_id: String,
    pub payload: TransactionPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Change notification for subscribed approval surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Added { transaction: PendingTransaction },
    Removed { request_id: String },
}

// =============================================================================
// Queue
// =============================================================================

/// Requester-side key of a request
type ReplyKey = (String, String);

fn reply_key(transaction: &PendingTransaction) -> ReplyKey {
    (
        transaction.source_context.clone(),
        transaction.correlation_id.clone(),
    )
}

#[derive(Default)]
struct Entries {
    /// Pending entries in enqueue order
    pending: VecDeque<PendingTransaction>,

    /// Taken entries whose answer has not been routed yet
    in_flight: HashSet<ReplyKey>,
}

impl Entries {
    fn holds(&self, source_context: &str, correlation_id: &str) -> bool {
        self.pending
            .iter()
            .any(|t| t.source_context == source_context && t.correlation_id == correlation_id)
            || self
                .in_flight
                .contains(&(source_context.to_string(), correlation_id.to_string()))
    }
}

pub struct TransactionQueue {
    entries: Mutex<Entries>,

    /// Change feed for the approval surface
    events: broadcast::Sender<QueueEvent>,
}

impl Default for TransactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(Entries::default()),
            events,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| VestibuleError::Internal("transaction queue poisoned".into()))
    }

    /// Queue an action request and return its id.
    ///
    /// `origin` must hold a grant; balance-affecting kinds also need an
    /// unlocked session. A correlation id already pending or in flight for
    /// the same context is refused.
    pub fn submit(
        &self,
        kind: TransactionKind,
        origin: &str,
        source_context: &str,
        correlation_id: &str,
        payload: serde_json::Value,
        broker: &ConnectBroker,
        sessions: &SessionStore,
    ) -> Result<String> {
        broker.require_grant(origin)?;
        if kind.affects_balance() && !sessions.is_unlocked() {
            return Err(VestibuleError::Locked);
        }

        let payload = TransactionPayload::parse(kind, payload)?;
        let transaction = PendingTransaction {
            request_id: Uuid::new_v4().to_string(),
            kind,
            origin: origin.to_string(),
            source_context: source_context.to_string(),
            correlation_id: correlation_id.to_string(),
            payload,
            enqueued_at: Utc::now(),
        };
        let request_id = transaction.request_id.clone();

        {
            let mut entries = self.entries()?;
            if entries.holds(source_context, correlation_id) {
                return Err(VestibuleError::InvalidRequest(format!(
                    "correlation id {correlation_id} already names a request from {source_context}"
                )));
            }
            entries.pending.push_back(transaction.clone());
        }
        info!(
            request_id = %request_id,
            kind = %kind,
            origin = %origin,
            "Transaction queued for approval"
        );
        let _ = self.events.send(QueueEvent::Added { transaction });

        Ok(request_id)
    }

    /// Pending entries in enqueue order
    pub fn list(&self) -> Vec<PendingTransaction> {
        self.entries()
            .map(|entries| entries.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look at an entry without removing it
    pub fn get(&self, request_id: &str) -> Option<PendingTransaction> {
        self.entries()
            .ok()?
            .pending
            .iter()
            .find(|t| t.request_id == request_id)
            .cloned()
    }

    /// Remove an entry. Only one caller ever gets a given entry back.
    ///
    /// The entry's correlation id stays reserved until [`Self::finish`].
    pub fn take(&self, request_id: &str) -> Result<PendingTransaction> {
        let taken = {
            let mut entries = self.entries()?;
            let taken = entries
                .pending
                .iter()
                .position(|t| t.request_id == request_id)
                .and_then(|index| entries.pending.remove(index));
            if let Some(transaction) = &taken {
                entries.in_flight.insert(reply_key(transaction));
            }
            taken
        };

        match taken {
            Some(transaction) => {
                debug!(request_id = %request_id, "Transaction removed from queue");
                let _ = self.events.send(QueueEvent::Removed {
                    request_id: request_id.to_string(),
                });
                Ok(transaction)
            }
            None => Err(VestibuleError::NotFound(format!(
                "no pending transaction {request_id}"
            ))),
        }
    }

    /// Release the correlation id of a taken entry once it has been answered
    pub fn finish(&self, transaction: &PendingTransaction) {
        if let Ok(mut entries) = self.entries() {
            entries.in_flight.remove(&reply_key(transaction));
        }
    }

    /// Drop every entry without notifying the requesters
    pub fn clear(&self) -> usize {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.in_flight.clear();
        let drained: Vec<_> = entries.pending.drain(..).collect();
        drop(entries);
        for transaction in &drained {
            let _ = self.events.send(QueueEvent::Removed {
                request_id: transaction.request_id.clone(),
            });
        }
        drained.len()
    }

    /// Subscribe to queue changes
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::HeadlessSurface;
    use crate::session::Vault;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sessions: SessionStore,
        broker: ConnectBroker,
        queue: TransactionQueue,
    }

    /// Locked store, with `https://a.example` already granted
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sessions = SessionStore::new(Vault::in_dir(dir.path()));
        let broker = ConnectBroker::new(Duration::from_secs(60), Arc::new(HeadlessSurface));
        broker.grant("https://a.example");

        Fixture {
            _dir: dir,
            sessions,
            broker,
            queue: TransactionQueue::new(),
        }
    }

    fn sign_payload(message: &str) -> serde_json::Value {
        json!({ "message": message })
    }

    #[tokio::test]
    async fn test_submit_requires_grant() {
        let f = fixture();
        let result = f.queue.submit(
            TransactionKind::SignMessage,
            "https://stranger.example",
            "tab-1",
            "c-1",
            sign_payload("hi"),
            &f.broker,
            &f.sessions,
        );
        assert!(matches!(result, Err(VestibuleError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_send_requires_unlocked_session() {
        let f = fixture();
        let result = f.queue.submit(
            TransactionKind::Send,
            "https://a.example",
            "tab-1",
            "c-1",
            json!({ "coin_id": "X", "amount": 10, "recipient": "bob" }),
            &f.broker,
            &f.sessions,
        );
        assert!(matches!(result, Err(VestibuleError::Locked)));
    }

    #[tokio::test]
    async fn test_signing_can_queue_while_locked() {
        let f = fixture();
        let id = f
            .queue
            .submit(
                TransactionKind::SignMessage,
                "https://a.example",
                "tab-1",
                "c-1",
                sign_payload("hi"),
                &f.broker,
                &f.sessions,
            )
            .unwrap();
        assert_eq!(f.queue.list()[0].request_id, id);
    }

    #[tokio::test]
    async fn test_list_keeps_enqueue_order_and_take_is_once() {
        let f = fixture();
        let ids: Vec<String> = (0..3)
            .map(|i| {
                f.queue
                    .submit(
                        TransactionKind::SignMessage,
                        "https://a.example",
                        "tab-1",
                        &format!("c-{i}"),
                        sign_payload(&format!("m{i}")),
                        &f.broker,
                        &f.sessions,
                    )
                    .unwrap()
            })
            .collect();

        let listed: Vec<String> = f.queue.list().into_iter().map(|t| t.request_id).collect();
        assert_eq!(listed, ids);

        assert!(f.queue.take(&ids[1]).is_ok());
        assert!(matches!(f.queue.take(&ids[1]), Err(VestibuleError::NotFound(_))));

        let listed: Vec<String> = f.queue.list().into_iter().map(|t| t.request_id).collect();
        assert_eq!(listed, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_correlation_id_is_reserved_until_finished() {
        let f = fixture();
        let submit = |context: &str| {
            f.queue.submit(
                TransactionKind::SignMessage,
                "https://a.example",
                context,
                "same",
                sign_payload("hi"),
                &f.broker,
                &f.sessions,
            )
        };

        let id = submit("tab-1").unwrap();
        assert!(matches!(submit("tab-1"), Err(VestibuleError::InvalidRequest(_))));

        // Another context may reuse the id
        assert!(submit("tab-2").is_ok());

        // Taken but unanswered still holds the id
        let taken = f.queue.take(&id).unwrap();
        assert!(matches!(submit("tab-1"), Err(VestibuleError::InvalidRequest(_))));

        f.queue.finish(&taken);
        assert!(submit("tab-1").is_ok());
        assert_eq!(f.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_sees_added_and_removed() {
        let f = fixture();
        let mut events = f.queue.subscribe();

        let id = f
            .queue
            .submit(
                TransactionKind::SignMessage,
                "https://a.example",
                "tab-1",
                "c-1",
                sign_payload("hi"),
                &f.broker,
                &f.sessions,
            )
            .unwrap();
        f.queue.take(&id).unwrap();

        match events.recv().await.unwrap() {
            QueueEvent::Added { transaction } => assert_eq!(transaction.request_id, id),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::Removed { request_id: id }
        );
    }

    #[test]
    fn test_payload_validation() {
        assert!(matches!(
            TransactionPayload::parse(
                TransactionKind::Send,
                json!({ "coin_id": "X", "amount": 0, "recipient": "bob" })
            ),
            Err(VestibuleError::InvalidRequest(_))
        ));
        assert!(matches!(
            TransactionPayload::parse(
                TransactionKind::SignMessage,
                json!({ "message": "abcd", "prehashed": true })
            ),
            Err(VestibuleError::InputSize { expected: 32, actual: 2 })
        ));
        let event = TransactionPayload::parse(
            TransactionKind::SignProtocolEvent,
            json!({ "created_at": 1, "kind": 1, "content": "hello" }),
        )
        .unwrap();
        assert_eq!(event.kind(), TransactionKind::SignProtocolEvent);
    }
}
