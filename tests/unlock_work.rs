//! Post-unlock work: storage migration, name-binding repair, journal recovery.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use vestibule::approval::{
    ApprovalPhase, PendingTransaction, SendPayload, TransactionKind, TransactionPayload,
};
use vestibule::binding::BindingState;
use vestibule::signer::identity_public_key;
use vestibule::storage::{AddressForm, CANONICAL_KEY};
use vestibule::{Coordinator, VestibuleError};

use common::{harness, other_keys, wallet_keys, Harness, SECRET, SEED};

// =============================================================================
// Storage migration
// =============================================================================

fn seed_legacy_data(h: &Harness) -> String {
    let identity_key = identity_public_key(&SEED).unwrap();
    let legacy = AddressForm::Legacy.encode(&identity_key).unwrap();

    let namespace = h.coordinator.kv().namespace(&legacy);
    namespace.put(CANONICAL_KEY, &json!({ "legacy": true })).unwrap();
    namespace.put("preferences", &json!({ "currency": "ALPHA" })).unwrap();

    let db = h.coordinator.objects().open(&legacy).unwrap();
    db.put_record("tokens", "t-1", &json!({ "amount": 5 })).unwrap();
    db.put_record("tokens", "t-2", &json!({ "amount": 7 })).unwrap();
    db.flush().unwrap();
    drop(db);

    legacy
}

#[tokio::test]
async fn test_first_unlock_migrates_legacy_storage() {
    let h = harness().await;
    seed_legacy_data(&h);

    let report = h.unlock().await;
    assert!(report.address.starts_with("addr1"));

    let migration = report.migration.expect("migration should run on first unlock");
    assert!(!migration.skipped);
    assert_eq!(migration.keys_copied, 2);
    assert_eq!(migration.tables_copied, 1);
    assert_eq!(migration.records_copied, 2);

    let current = h.coordinator.kv().namespace(&report.address);
    assert_eq!(
        current.get::<serde_json::Value>("preferences").unwrap(),
        Some(json!({ "currency": "ALPHA" }))
    );
    assert!(current.contains(CANONICAL_KEY).unwrap());

    let db = h.coordinator.object_db().unwrap();
    assert_eq!(db.count("tokens").unwrap(), 2);
    assert_eq!(
        db.get_record::<serde_json::Value>("tokens", "t-2").unwrap(),
        Some(json!({ "amount": 7 }))
    );
}

#[tokio::test]
async fn test_migration_runs_once() {
    let h = harness().await;
    seed_legacy_data(&h);

    assert!(h.unlock().await.migration.is_some());
    h.coordinator.lock().await;

    let again = h.unlock().await;
    assert!(again.migration.is_none());
    assert!(again.warnings.is_empty());
}

#[tokio::test]
async fn test_fresh_wallet_records_canonical_identity() {
    let h = harness().await;

    let report = h.unlock().await;
    assert!(report.transport_connected);

    let namespace = h.coordinator.kv().namespace(&report.address);
    let record: serde_json::Value = namespace.get(CANONICAL_KEY).unwrap().unwrap();
    assert_eq!(record["address"], json!(report.address));
}

// =============================================================================
// Name binding
// =============================================================================

#[tokio::test]
async fn test_claim_publishes_binding() {
    let h = harness().await;
    h.unlock().await;

    let report = h.coordinator.claim_name("alice").await.unwrap();
    assert_eq!(report.state, BindingState::Consistent);
    assert!(report.republished);
    assert_eq!(h.directory.get("alice"), Some(wallet_keys().public_key_hex()));
    assert!(h.proofs.is_current("alice"));

    let binding = h.coordinator.name_binding().unwrap().unwrap();
    assert_eq!(binding.bound_key_fingerprint, wallet_keys().fingerprint());
    assert!(binding.verified_at.is_some());
}

#[tokio::test]
async fn test_claiming_a_taken_name_fails() {
    let h = harness().await;
    h.unlock().await;
    h.directory.set("alice", &other_keys().public_key_hex());

    let result = h.coordinator.claim_name("alice").await;
    assert!(matches!(result, Err(VestibuleError::InvalidRequest(_))));
    assert!(h.coordinator.name_binding().unwrap().is_none());
}

#[tokio::test]
async fn test_drifted_binding_is_republished_once() {
    let h = harness().await;
    h.unlock().await;
    h.coordinator.claim_name("alice").await.unwrap();
    let after_claim = h.directory.publishes.load(Ordering::SeqCst);

    // Another device rebinds the name under an older derivation
    h.directory.set("alice", &other_keys().public_key_hex());
    h.coordinator.lock().await;

    let report = h.unlock().await;
    let reconcile = report.reconcile.unwrap();
    assert!(reconcile.drift_detected);
    assert!(reconcile.republished);
    assert_eq!(reconcile.state, BindingState::Consistent);
    assert_eq!(h.directory.get("alice"), Some(wallet_keys().public_key_hex()));
    assert_eq!(h.directory.publishes.load(Ordering::SeqCst), after_claim + 1);

    // Next unlock finds nothing to repair
    h.coordinator.lock().await;
    let report = h.unlock().await;
    let reconcile = report.reconcile.unwrap();
    assert!(!reconcile.drift_detected);
    assert!(!reconcile.republished);
    assert_eq!(h.directory.publishes.load(Ordering::SeqCst), after_claim + 1);
    assert_eq!(h.coordinator.binding_state(), BindingState::Consistent);
}

#[tokio::test]
async fn test_unreachable_directory_never_fails_unlock() {
    let h = harness().await;
    h.unlock().await;
    h.coordinator.claim_name("alice").await.unwrap();
    h.coordinator.lock().await;

    h.directory.unreachable.store(true, Ordering::SeqCst);
    h.coordinator.unlock(SECRET).await.unwrap();
    assert!(h.coordinator.is_unlocked());

    let report = h.coordinator.wait_for_unlock_tasks().await.unwrap();
    assert!(!report.transport_connected);
    assert_eq!(report.reconcile.unwrap().state, BindingState::Unreachable);
    assert!(!report.warnings.is_empty());
    assert_eq!(h.coordinator.binding_state(), BindingState::Unreachable);
}

// =============================================================================
// Journal recovery
// =============================================================================

#[tokio::test]
async fn test_unsettled_approval_is_failed_on_reopen() {
    let h = harness().await;
    let transaction = PendingTransaction {
        request_id: "req-1".into(),
        kind: TransactionKind::Send,
        origin: "https://shop.example".into(),
        source_context: "tab-1".into(),
        correlation_id: "c-1".into(),
        payload: TransactionPayload::Send(SendPayload {
            coin_id: "ALPHA".into(),
            amount: 5,
            recipient: "@bob".into(),
        }),
        enqueued_at: Utc::now(),
    };
    h.coordinator.journal().reserve(&transaction).unwrap();
    h.coordinator
        .journal()
        .advance("req-1", ApprovalPhase::Executing, None)
        .unwrap();

    let collaborators = h.collaborators();
    let config = h.config();
    let Harness {
        coordinator,
        dir: _dir,
        ..
    } = h;
    coordinator.shutdown().await;
    drop(Arc::try_unwrap(coordinator).ok().expect("no other coordinator handles"));

    let reopened = Coordinator::open(config, collaborators).await.unwrap();
    assert_eq!(reopened.interrupted().len(), 1);
    assert_eq!(reopened.interrupted()[0].request_id, "req-1");

    let entry = reopened.journal().get("req-1").unwrap().unwrap();
    assert_eq!(entry.phase, ApprovalPhase::Failed);
}
