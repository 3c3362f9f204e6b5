//! Kind-specific effects of an approved request.
//!
//! Keys are recomputed from the live session on every call and dropped
//! (zeroized) when the call returns.

use serde_json::{json, Value};
use tracing::debug;

use super::queue::{PendingTransaction, TransactionPayload};
use crate::services::PaymentEngine;
use crate::session::Session;
use crate::signer::{sign_hash, sign_message};
use crate::types::{Result, VestibuleError};

/// Run the effect of `transaction` and return its result body
pub async fn execute(
    transaction: &PendingTransaction,
    session: &Session,
    engine: &dyn PaymentEngine,
) -> Result<Value> {
    debug!(
        request_id = %transaction.request_id,
        kind = %transaction.kind,
        "Executing approved request"
    );

    match &transaction.payload {
        TransactionPayload::Send(send) => {
            let receipt = engine
                .send(&send.coin_id, send.amount, &send.recipient)
                .await?;
            Ok(serde_json::to_value(receipt)?)
        }

        TransactionPayload::SignMessage(sign) => {
            let keys = session.derived_keys()?;
            let signature = if sign.prehashed {
                let hash = hex::decode(&sign.message)
                    .map_err(|e| VestibuleError::InvalidRequest(format!("bad hash hex: {e}")))?;
                sign_hash(&keys.private_key, &hash)?
            } else {
                sign_message(&keys.private_key, sign.message.as_bytes())?
            };
            Ok(json!({
                "signature": hex::encode(signature),
                "public_key": keys.public_key_hex(),
            }))
        }

        TransactionPayload::SignProtocolEvent(event) => {
            let keys = session.derived_keys()?;
            let signed = event.clone().sign(&keys)?;
            Ok(serde_json::to_value(signed)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::queue::{SendPayload, SignMessagePayload, TransactionKind};
    use crate::services::{Balance, CollaboratorResult, ReceiveOutcome, TransferReceipt};
    use crate::signer::{verify_message, SignedEvent, UnsignedEvent};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zeroize::Zeroizing;

    #[derive(Default)]
    struct CountingEngine {
        sends: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PaymentEngine for CountingEngine {
        async fn send(
            &self,
            coin_id: &str,
            amount: u64,
            recipient: &str,
        ) -> CollaboratorResult<TransferReceipt> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(TransferReceipt {
                transfer_id: format!("tx-{n}"),
                coin_id: coin_id.to_string(),
                amount,
                recipient: recipient.to_string(),
            })
        }

        async fn receive(&self, _payload: &str) -> CollaboratorResult<ReceiveOutcome> {
            unimplemented!()
        }

        async fn get_balances(&self) -> CollaboratorResult<Vec<Balance>> {
            Ok(vec![])
        }
    }

    fn session() -> Session {
        Session::new(Zeroizing::new([21u8; 32])).unwrap()
    }

    fn transaction(payload: TransactionPayload) -> PendingTransaction {
        PendingTransaction {
            request_id: "r1".into(),
            kind: payload.kind(),
            origin: "https://a.example".into(),
            source_context: "tab-1".into(),
            correlation_id: "c-1".into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_send_goes_through_engine() {
        let engine = CountingEngine::default();
        let tx = transaction(TransactionPayload::Send(SendPayload {
            coin_id: "X".into(),
            amount: 10,
            recipient: "bob".into(),
        }));
        assert_eq!(tx.kind, TransactionKind::Send);

        let result = execute(&tx, &session(), &engine).await.unwrap();
        let receipt: TransferReceipt = serde_json::from_value(result).unwrap();
        assert_eq!(receipt.amount, 10);
        assert_eq!(engine.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_message_signature_is_deterministic_and_valid() {
        let engine = CountingEngine::default();
        let session = session();
        let tx = transaction(TransactionPayload::SignMessage(SignMessagePayload {
            message: "hello".into(),
            prehashed: false,
        }));

        let first = execute(&tx, &session, &engine).await.unwrap();
        let second = execute(&tx, &session, &engine).await.unwrap();
        assert_eq!(first, second);

        let keys = session.derived_keys().unwrap();
        let signature = hex::decode(first["signature"].as_str().unwrap()).unwrap();
        assert!(verify_message(&keys.public_key, b"hello", &signature));
        assert_eq!(engine.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_protocol_event_is_signed() {
        let engine = CountingEngine::default();
        let tx = transaction(TransactionPayload::SignProtocolEvent(UnsignedEvent {
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "gm".into(),
        }));

        let result = execute(&tx, &session(), &engine).await.unwrap();
        let signed: SignedEvent = serde_json::from_value(result).unwrap();
        assert!(signed.verify());
    }
}
