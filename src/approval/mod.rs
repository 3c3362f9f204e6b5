//! Transaction Queue + Approval Router
//!
//! - **queue**: pending action requests, taken out exactly once
//! - **journal**: durable `Reserved → Executing → {Settled, Failed}` record
//! - **router**: routes each result back to its source context
//! - **executor**: runs the kind-specific effect of an approved request

pub mod executor;
pub mod journal;
pub mod queue;
pub mod router;

pub use executor::execute;
pub use journal::{ApprovalJournal, ApprovalPhase, JournalEntry};
pub use queue::{
    PendingTransaction, QueueEvent, SendPayload, SignMessagePayload, TransactionKind,
    TransactionPayload, TransactionQueue,
};
pub use router::{ApprovalRouter, EnvelopeReceiver, EnvelopeSender};
