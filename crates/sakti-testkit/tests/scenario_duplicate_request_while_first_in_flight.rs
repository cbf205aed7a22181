use sakti_core::{OperationKind, TxErrorKind};
use sakti_engine::ExecuteRequest;
use sakti_kv::KvClient;
use sakti_testkit::{FakeDatabase, Harness};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Two calls share one idempotency key; the first is still in flight when
/// the second arrives. The second must fail immediately with
/// DUPLICATE_REQUEST and leave no journal row behind.
#[tokio::test]
async fn duplicate_key_rejected_while_first_call_is_in_flight() -> anyhow::Result<()> {
    let db = FakeDatabase::new("dbA");
    let h = Arc::new(Harness::builder().register(Arc::clone(&db)).build());

    let (proceed_tx, proceed_rx) = oneshot::channel::<()>();
    let (started_tx, started_rx) = oneshot::channel::<()>();

    // First call: marks the key processing, then parks inside the closure.
    let first = {
        let h = Arc::clone(&h);
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            h.coordinator
                .execute(
                    // Distinct lock keys: the collision under test is the
                    // idempotency key, not the lock.
                    ExecuteRequest::new("acct-first", "op-77").with_idempotency_key("op-77"),
                    |tx| async move {
                        tx.enlist_database("dbA").await?;
                        db.stage_put("Account", "1", json!({"id": "1"}));
                        tx.record_entity_op(
                            "dbA",
                            OperationKind::Insert,
                            "Account",
                            Some("1".into()),
                            None,
                        )?;
                        let _ = started_tx.send(());
                        proceed_rx.await.ok();
                        Ok(())
                    },
                )
                .await
        })
    };

    started_rx.await.expect("first call reached its closure");

    // Second call, same idempotency key, while the first is parked.
    let err = h
        .coordinator
        .execute(
            ExecuteRequest::new("acct-second", "op-77").with_idempotency_key("op-77"),
            |tx| async move {
                tx.enlist_database("dbA").await?;
                Ok(())
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.as_tx().unwrap().kind(),
        TxErrorKind::DuplicateRequest,
        "in-flight key must be refused"
    );

    // Only the first call ever opened a journal row.
    assert_eq!(h.store.row_count(), 1);

    proceed_tx.send(()).ok();
    first.await?.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // After completion the marker is `completed`, so the same key keeps
    // being refused.
    let marker = h.kv.get("sakti:idemp:op-77").await?.unwrap();
    assert!(marker.starts_with("completed:"));
    assert_eq!(h.metrics.snapshot().duplicates_rejected, 1);
    Ok(())
}
