//! Approval Router
//!
//! Delivers each result envelope to the context that asked for it. Contexts
//! register an outbound channel under their context id; a result for a
//! context that has gone away is dropped, since delivery is at-most-once and
//! requesters keep their own timeout.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ResultEnvelope;

pub type EnvelopeSender = mpsc::UnboundedSender<ResultEnvelope>;
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<ResultEnvelope>;

#[derive(Default)]
pub struct ApprovalRouter {
    routes: DashMap<String, EnvelopeSender>,
}

impl ApprovalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `context_id` and get the receiving end of its route
    pub fn register(&self, context_id: &str) -> EnvelopeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(context_id, tx);
        rx
    }

    /// Route `context_id` into an existing channel (several contexts may
    /// share one outbound stream)
    pub fn attach(&self, context_id: &str, sender: EnvelopeSender) {
        if self.routes.insert(context_id.to_string(), sender).is_some() {
            debug!(context = %context_id, "Replaced route for context");
        }
    }

    pub fn is_registered(&self, context_id: &str) -> bool {
        self.routes
            .get(context_id)
            .map(|route| !route.is_closed())
            .unwrap_or(false)
    }

    pub fn unregister(&self, context_id: &str) {
        self.routes.remove(context_id);
    }

    /// Deliver `envelope` to `context_id`. Returns whether it was handed off.
    pub fn route(&self, context_id: &str, envelope: ResultEnvelope) -> bool {
        let delivered = match self.routes.get(context_id) {
            Some(route) => route.send(envelope).is_ok(),
            None => false,
        };

        if !delivered {
            warn!(context = %context_id, "Result dropped, context is gone");
            self.routes.remove_if(context_id, |_, route| route.is_closed());
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VestibuleError;
    use serde_json::json;

    #[tokio::test]
    async fn test_routes_to_registered_context() {
        let router = ApprovalRouter::new();
        let mut rx = router.register("tab-1");

        assert!(router.route("tab-1", ResultEnvelope::ok("r1", json!({"ok": true}))));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.correlation_id, "r1");
    }

    #[tokio::test]
    async fn test_gone_context_drops_result() {
        let router = ApprovalRouter::new();
        let rx = router.register("tab-1");
        drop(rx);

        assert!(!router.route("tab-1", ResultEnvelope::err("r1", &VestibuleError::Locked)));
        assert!(!router.is_registered("tab-1"));
        assert!(!router.route("never-seen", ResultEnvelope::ok("r2", json!(null))));
    }

    #[tokio::test]
    async fn test_attached_contexts_share_a_stream() {
        let router = ApprovalRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.attach("tab-1", tx.clone());
        router.attach("tab-2", tx);

        router.route("tab-2", ResultEnvelope::ok("b", json!(2)));
        router.route("tab-1", ResultEnvelope::ok("a", json!(1)));
        assert_eq!(rx.recv().await.unwrap().correlation_id, "b");
        assert_eq!(rx.recv().await.unwrap().correlation_id, "a");
    }
}
