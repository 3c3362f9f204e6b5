//! Approval Journal
//!
//! Durable record of every approval that left the queue.
//!
//! ```text
//! Reserved ──▶ Executing ──▶ Settled
//!    │              │
//!    └──────────────┴──────▶ Failed
//! ```
//!
//! `reserve` is a sled compare-and-swap against an absent key, so one id is
//! reserved at most once for the life of the journal. Entries still
//! `Reserved` or `Executing` at startup belonged to a run that died
//! mid-approval; [`ApprovalJournal::recover`] closes them as `Failed` so
//! their requesters can be told the outcome is unknown.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::queue::{PendingTransaction, TransactionKind};
use crate::types::{Result, VestibuleError};

/// sled tree holding the journal
pub const JOURNAL_TREE: &str = "approvals";

/// Detail recorded on entries closed by recovery
pub const INTERRUPTED: &str = "interrupted before settlement";

/// Phase of an approved request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPhase {
    Reserved,
    Executing,
    Settled,
    Failed,
}

impl ApprovalPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    fn can_advance_to(self, next: ApprovalPhase) -> bool {
        matches!(
            (self, next),
            (Self::Reserved, Self::Executing)
                | (Self::Reserved, Self::Failed)
                | (Self::Executing, Self::Settled)
                | (Self::Executing, Self::Failed)
        )
    }
}

/// One journaled approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub request_id: String,
    pub kind: TransactionKind,
    pub origin: String,
    pub source_context: String,
    pub correlation_id: String,
    pub phase: ApprovalPhase,
    pub updated_at: DateTime<Utc>,
    /// Failure reason or settlement reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// sled-backed approval journal
#[derive(Clone)]
pub struct ApprovalJournal {
    tree: sled::Tree,
}

impl ApprovalJournal {
    /// Open the journal tree in `db`
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(JOURNAL_TREE)?,
        })
    }

    fn encode(entry: &JournalEntry) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(entry)?)
    }

    fn decode(bytes: &[u8]) -> Result<JournalEntry> {
        serde_json::from_slice(bytes)
            .map_err(|e| VestibuleError::Storage(format!("corrupt journal entry: {e}")))
    }

    /// Record that `transaction` left the queue for execution
    pub fn reserve(&self, transaction: &PendingTransaction) -> Result<JournalEntry> {
        let entry = JournalEntry {
            request_id: transaction.request_id.clone(),
            kind: transaction.kind,
            origin: transaction.origin.clone(),
            source_context: transaction.source_context.clone(),
            correlation_id: transaction.correlation_id.clone(),
            phase: ApprovalPhase::Reserved,
            updated_at: Utc::now(),
            detail: None,
        };

        let swapped = self.tree.compare_and_swap(
            entry.request_id.as_bytes(),
            None as Option<&[u8]>,
            Some(Self::encode(&entry)?),
        )?;
        if swapped.is_err() {
            return Err(VestibuleError::NotFound(format!(
                "request {} was already approved",
                entry.request_id
            )));
        }

        self.tree.flush()?;
        debug!(request_id = %entry.request_id, "Approval reserved");
        Ok(entry)
    }

    /// Move `request_id` to `phase`
    pub fn advance(
        &self,
        request_id: &str,
        phase: ApprovalPhase,
        detail: Option<String>,
    ) -> Result<JournalEntry> {
        let current_bytes = self
            .tree
            .get(request_id.as_bytes())?
            .ok_or_else(|| VestibuleError::NotFound(format!("no journal entry {request_id}")))?;
        let current = Self::decode(&current_bytes)?;

        if !current.phase.can_advance_to(phase) {
            return Err(VestibuleError::Internal(format!(
                "journal entry {request_id} cannot move from {:?} to {phase:?}",
                current.phase
            )));
        }

        let next = JournalEntry {
            phase,
            updated_at: Utc::now(),
            detail,
            ..current
        };
        let swapped = self.tree.compare_and_swap(
            request_id.as_bytes(),
            Some(current_bytes),
            Some(Self::encode(&next)?),
        )?;
        if swapped.is_err() {
            return Err(VestibuleError::Internal(format!(
                "journal entry {request_id} changed concurrently"
            )));
        }

        self.tree.flush()?;
        Ok(next)
    }

    pub fn get(&self, request_id: &str) -> Result<Option<JournalEntry>> {
        self.tree
            .get(request_id.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    /// All entries
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        self.tree
            .iter()
            .values()
            .map(|value| Self::decode(&value?))
            .collect()
    }

    /// Close every unfinished entry as `Failed` and return them
    pub fn recover(&self) -> Result<Vec<JournalEntry>> {
        let mut recovered = Vec::new();
        for entry in self.entries()? {
            if entry.phase.is_terminal() {
                continue;
            }
            warn!(
                request_id = %entry.request_id,
                phase = ?entry.phase,
                "Approval interrupted by restart"
            );
            recovered.push(self.advance(
                &entry.request_id,
                ApprovalPhase::Failed,
                Some(INTERRUPTED.to_string()),
            )?);
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted approvals");
        }
        Ok(recovered)
    }

    /// Remove terminal entries older than `retention`
    pub fn prune(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| VestibuleError::Config(format!("journal retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;

        let mut removed = 0;
        for entry in self.entries()? {
            if entry.phase.is_terminal() && entry.updated_at < cutoff {
                self.tree.remove(entry.request_id.as_bytes())?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.tree.flush()?;
            debug!(removed, "Pruned settled approvals from journal");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::queue::{SignMessagePayload, TransactionPayload};
    use tempfile::TempDir;

    fn journal() -> (TempDir, ApprovalJournal) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        (dir, ApprovalJournal::open(&db).unwrap())
    }

    fn transaction(id: &str) -> PendingTransaction {
        PendingTransaction {
            request_id: id.to_string(),
            kind: TransactionKind::SignMessage,
            origin: "https://a.example".into(),
            source_context: "tab-1".into(),
            correlation_id: "c-1".into(),
            payload: TransactionPayload::SignMessage(SignMessagePayload {
                message: "hi".into(),
                prehashed: false,
            }),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_reserve_is_once_per_id() {
        let (_dir, journal) = journal();
        journal.reserve(&transaction("r1")).unwrap();
        assert!(matches!(
            journal.reserve(&transaction("r1")),
            Err(VestibuleError::NotFound(_))
        ));
    }

    #[test]
    fn test_phase_transitions() {
        let (_dir, journal) = journal();
        journal.reserve(&transaction("r1")).unwrap();
        journal.advance("r1", ApprovalPhase::Executing, None).unwrap();
        let settled = journal
            .advance("r1", ApprovalPhase::Settled, Some("tx-9".into()))
            .unwrap();
        assert_eq!(settled.phase, ApprovalPhase::Settled);
        assert_eq!(settled.detail.as_deref(), Some("tx-9"));

        // Terminal phases stay terminal
        assert!(journal.advance("r1", ApprovalPhase::Failed, None).is_err());
    }

    #[test]
    fn test_recover_closes_unfinished_entries() {
        let (_dir, journal) = journal();
        journal.reserve(&transaction("reserved")).unwrap();
        journal.reserve(&transaction("executing")).unwrap();
        journal
            .advance("executing", ApprovalPhase::Executing, None)
            .unwrap();
        journal.reserve(&transaction("settled")).unwrap();
        journal.advance("settled", ApprovalPhase::Executing, None).unwrap();
        journal.advance("settled", ApprovalPhase::Settled, None).unwrap();

        let mut recovered: Vec<String> = journal
            .recover()
            .unwrap()
            .into_iter()
            .map(|e| e.request_id)
            .collect();
        recovered.sort();
        assert_eq!(recovered, vec!["executing", "reserved"]);

        let entry = journal.get("reserved").unwrap().unwrap();
        assert_eq!(entry.phase, ApprovalPhase::Failed);
        assert_eq!(entry.detail.as_deref(), Some(INTERRUPTED));

        // Nothing left to recover
        assert!(journal.recover().unwrap().is_empty());
    }

    #[test]
    fn test_prune_only_removes_terminal_entries() {
        let (_dir, journal) = journal();
        journal.reserve(&transaction("open")).unwrap();
        journal.reserve(&transaction("done")).unwrap();
        journal.advance("done", ApprovalPhase::Failed, None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(journal.prune(Duration::ZERO).unwrap(), 1);
        assert!(journal.get("done").unwrap().is_none());
        assert!(journal.get("open").unwrap().is_some());
    }
}
