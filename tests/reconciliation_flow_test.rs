mod common;

use std::sync::Arc;

use common::{checkout_completed, open_engine, signed, subscription_deleted, StubProvider};
use tierwise::{Action, GateOutcome, LedgerEventType, ReconcileOutcome, SubscriptionStatus};

async fn converse(engine: &tierwise::EntitlementEngine<tierwise::FileLedgerStore>, user: &str) -> bool {
    let outcome = engine
        .check_and_maybe_deny(user, &Action::Conversation, None)
        .await
        .unwrap();
    if outcome.is_allowed() {
        engine
            .record_completed_action(user, &Action::Conversation, 1)
            .unwrap();
        engine.gate().worker().wait_idle().await;
    }
    outcome.is_allowed()
}

#[tokio::test]
async fn test_free_quota_upgrade_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(StubProvider::default())).await;

    engine
        .sign_in("auth0|ada", "ada@example.com", Some("Ada"))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(converse(&engine, "auth0|ada").await);
    }
    match engine
        .check_and_maybe_deny("auth0|ada", &Action::Conversation, None)
        .await
        .unwrap()
    {
        GateOutcome::Denied(denial) => {
            assert!(denial.upgrade_required);
            assert_eq!(denial.used, 3);
        }
        other => panic!("expected denial, got {:?}", other),
    }

    let (raw, header) = signed(&checkout_completed(
        "evt_checkout",
        "ada@example.com",
        "sub_ada",
        "premium",
    ));
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            user_id: "auth0|ada".to_string()
        }
    );

    let status = engine.entitlement_status("auth0|ada").await.unwrap();
    assert_eq!(status.plan, "premium");
    assert_eq!(status.used, 0);
    assert_eq!(status.remaining, -1);
    assert!(converse(&engine, "auth0|ada").await);

    let (raw, header) = signed(&subscription_deleted("evt_deleted", "sub_ada"));
    engine.apply_billing_event(&raw, &header).await.unwrap();

    let record = engine.ledger().get("auth0|ada").await.unwrap().unwrap();
    assert_eq!(record.subscription_type, "free");
    assert_eq!(record.subscription_status, SubscriptionStatus::Cancelled);
    assert!(record.billing_subscription_id.is_none());

    let types: Vec<LedgerEventType> = engine
        .event_log()
        .unwrap()
        .for_user("auth0|ada")
        .await
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types.first(), Some(&LedgerEventType::UserSignedUp));
    assert!(types.contains(&LedgerEventType::SubscriptionCreated));
    assert_eq!(types.last(), Some(&LedgerEventType::SubscriptionCancelled));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::default());

    let (raw, header) = signed(&checkout_completed(
        "evt_checkout",
        "bo@example.com",
        "sub_bo",
        "therapy",
    ));

    {
        let engine = open_engine(dir.path(), provider.clone()).await;
        engine.sign_in("bo", "bo@example.com", None).await.unwrap();
        engine.apply_billing_event(&raw, &header).await.unwrap();
        engine.shutdown().await;
    }

    let engine = open_engine(dir.path(), provider).await;
    let record = engine.ledger().get("bo").await.unwrap().unwrap();
    assert_eq!(record.subscription_type, "therapy");
    assert_eq!(record.billing_subscription_id.as_deref(), Some("sub_bo"));

    // The processed-id set was persisted with the ledger
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);

    let events = engine.event_log().unwrap().for_user("bo").await;
    assert_eq!(events.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_webhook_for_unknown_user_is_dropped_then_applied() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(StubProvider::default())).await;

    let (raw, header) = signed(&checkout_completed(
        "evt_early",
        "cy@example.com",
        "sub_cy",
        "premium",
    ));
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::UserNotFound);

    engine.sign_in("cy", "cy@example.com", None).await.unwrap();
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_checkout_portal_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::default());
    let engine = open_engine(dir.path(), provider.clone()).await;
    engine.sign_in("di", "di@example.com", None).await.unwrap();

    // No price is configured for premium in the default catalog
    assert!(engine.start_checkout("di", "premium").await.is_err());
    assert!(engine.open_billing_portal("di").await.is_err());
    assert!(engine.cancel_subscription("di").await.is_err());

    let (raw, header) = signed(&checkout_completed(
        "evt_di",
        "di@example.com",
        "sub_di",
        "premium",
    ));
    engine.apply_billing_event(&raw, &header).await.unwrap();

    let portal = engine.open_billing_portal("di").await.unwrap();
    assert!(portal.url.starts_with("https://portal.example.com/"));

    engine.cancel_subscription("di").await.unwrap();
    assert_eq!(provider.cancelled(), vec!["sub_di".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_keeps_recent_processed_events() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(StubProvider::default())).await;
    engine.sign_in("ed", "ed@example.com", None).await.unwrap();

    let (raw, header) = signed(&checkout_completed(
        "evt_ed",
        "ed@example.com",
        "sub_ed",
        "premium",
    ));
    engine.apply_billing_event(&raw, &header).await.unwrap();

    assert_eq!(engine.cleanup_processed_events().await.unwrap(), 0);
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_disk_failure_does_not_double_apply() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let engine = open_engine(&data_dir, Arc::new(StubProvider::default())).await;
    engine.sign_in("fay", "fay@example.com", None).await.unwrap();
    // A regular file where the data directory should be
    std::fs::remove_dir_all(&data_dir).unwrap();
    std::fs::write(&data_dir, b"").unwrap();

    engine
        .record_completed_action("fay", &Action::Conversation, 1)
        .unwrap();
    engine.gate().worker().wait_idle().await;
    let record = engine.ledger().get("fay").await.unwrap().unwrap();
    assert_eq!(record.usage_count, 1);

    let (raw, header) = signed(&checkout_completed(
        "evt_fay",
        "fay@example.com",
        "sub_fay",
        "premium",
    ));
    assert!(engine.apply_billing_event(&raw, &header).await.is_err());
    let outcome = engine.apply_billing_event(&raw, &header).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);

    let created = engine
        .event_log()
        .unwrap()
        .for_user("fay")
        .await
        .iter()
        .filter(|e| e.event_type == LedgerEventType::SubscriptionCreated)
        .count();
    assert_eq!(created, 1);
    engine.shutdown().await;
}
