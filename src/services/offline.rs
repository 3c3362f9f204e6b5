//! Stand-in collaborators for a host running without the wallet SDK.
//!
//! `OfflineEngine` answers every call with `Unavailable`, so approvals that
//! need the engine fail cleanly. `LocalDirectory` keeps name bindings in a
//! sled tree, enough to exercise binding reconciliation on one machine.

use tracing::debug;

use super::{
    Balance, BindingProofs, CollaboratorError, CollaboratorResult, MessageTransport,
    PaymentEngine, ProofArtifact, ReceiveOutcome, TokenInventory, TokenRef, TokenValidity,
    TransferReceipt, ValidationOracle,
};

/// sled tree used by [`LocalDirectory`]
pub const DIRECTORY_TREE: &str = "directory";

fn unavailable<T>() -> CollaboratorResult<T> {
    Err(CollaboratorError::Unavailable(
        "no payment engine attached".into(),
    ))
}

/// Payment engine, proof source, token inventory and oracle that are all absent
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineEngine;

#[async_trait::async_trait]
impl PaymentEngine for OfflineEngine {
    async fn send(&self, _: &str, _: u64, _: &str) -> CollaboratorResult<TransferReceipt> {
        unavailable()
    }

    async fn receive(&self, _: &str) -> CollaboratorResult<ReceiveOutcome> {
        unavailable()
    }

    async fn get_balances(&self) -> CollaboratorResult<Vec<Balance>> {
        unavailable()
    }
}

#[async_trait::async_trait]
impl BindingProofs for OfflineEngine {
    async fn binding_proof(&self, _: &str) -> CollaboratorResult<Option<ProofArtifact>> {
        unavailable()
    }

    async fn regenerate_binding_proof(
        &self,
        _: &str,
        _: &str,
        _: u32,
    ) -> CollaboratorResult<ProofArtifact> {
        unavailable()
    }
}

#[async_trait::async_trait]
impl TokenInventory for OfflineEngine {
    async fn tokens(&self) -> CollaboratorResult<Vec<TokenRef>> {
        unavailable()
    }
}

#[async_trait::async_trait]
impl ValidationOracle for OfflineEngine {
    async fn validate(&self, _: &TokenRef) -> CollaboratorResult<TokenValidity> {
        unavailable()
    }
}

/// Name directory kept in a local sled tree
#[derive(Clone)]
pub struct LocalDirectory {
    tree: sled::Tree,
}

impl LocalDirectory {
    pub fn open(db: &sled::Db) -> crate::types::Result<Self> {
        Ok(Self {
            tree: db.open_tree(DIRECTORY_TREE)?,
        })
    }
}

fn storage(e: sled::Error) -> CollaboratorError {
    CollaboratorError::Unavailable(format!("local directory: {e}"))
}

#[async_trait::async_trait]
impl MessageTransport for LocalDirectory {
    async fn connect(&self, public_key: &str) -> CollaboratorResult<()> {
        debug!(public_key = %public_key, "Local directory connected");
        Ok(())
    }

    async fn resolve_name(&self, name: &str) -> CollaboratorResult<Option<String>> {
        let value = self.tree.get(name.as_bytes()).map_err(storage)?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn publish_binding(&self, name: &str, target: &str) -> CollaboratorResult<bool> {
        self.tree
            .insert(name.as_bytes(), target.as_bytes())
            .map_err(storage)?;
        self.tree.flush_async().await.map_err(storage)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_directory_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let directory = LocalDirectory::open(&db).unwrap();

        assert_eq!(directory.resolve_name("alice").await.unwrap(), None);
        assert!(directory.publish_binding("alice", "abcd").await.unwrap());
        assert_eq!(
            directory.resolve_name("alice").await.unwrap(),
            Some("abcd".to_string())
        );
    }

    #[tokio::test]
    async fn test_offline_engine_is_unavailable() {
        let result = OfflineEngine.get_balances().await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
