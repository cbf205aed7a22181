use sakti_config::RecoveryConfig;
use sakti_core::{OperationKind, TxErrorKind, TxLogStatus};
use sakti_engine::ExecuteRequest;
use sakti_testkit::{FakeDatabase, Harness};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// dbB's commit fails AND dbA refuses the compensating delete: the
/// transaction must surface COMPENSATION_FAILED and leave a FAILED row
/// with the per-entry error recorded. An operator retry (reset to PENDING
/// after fixing dbA) then converges through the recovery worker.
#[tokio::test]
async fn failed_compensation_marks_failed_then_operator_retry_recovers() -> anyhow::Result<()> {
    let db_a = FakeDatabase::new("dbA");
    let db_b = FakeDatabase::new("dbB");
    db_b.fail_commit(true);
    db_a.fail_inverse_on("1");

    let h = Harness::builder()
        .register(Arc::clone(&db_a))
        .register(Arc::clone(&db_b))
        .build();

    let err = h
        .coordinator
        .execute(
            ExecuteRequest::new("acct-8", "transfer-008").with_idempotency_key("transfer-008"),
            |tx| {
                let db_a = Arc::clone(&db_a);
                async move {
                    tx.enlist_database("dbA").await?;
                    tx.enlist_database("dbB").await?;
                    db_a.stage_put("Account", "1", json!({"id": "1"}));
                    tx.record_entity_op("dbA", OperationKind::Insert, "Account", Some("1".into()), None)?;
                    tx.record_entity_op(
                        "dbB",
                        OperationKind::Update,
                        "Balance",
                        Some("2".into()),
                        Some(json!({"id": "2", "balance": 100})),
                    )?;
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

    let tx_err = err.as_tx().unwrap();
    assert_eq!(tx_err.kind(), TxErrorKind::CompensationFailed);
    assert!(!tx_err.kind().is_retryable(), "operator action required");

    let rows = h.store.all_rows();
    assert_eq!(rows.len(), 1);
    let tx_id = rows[0].tx_id.clone();
    assert_eq!(rows[0].status, TxLogStatus::Failed);

    // dbA's orphaned row is still there; the failure is recorded on its
    // entry while dbB's filtered entry is marked done.
    assert!(db_a.committed_row("Account", "1").is_some());
    let entry_a = &rows[0].payload.entries[0];
    assert!(!entry_a.compensated);
    assert!(entry_a.compensation_error.as_deref().unwrap().contains("refused"));
    assert!(rows[0].payload.entries[1].compensated);

    let m = h.metrics.snapshot();
    assert_eq!(m.failed, 1);
    assert_eq!(m.compensation_failures, 1);

    // Operator fixes dbA and re-queues the row for recovery.
    db_a.clear_inverse_failures();
    h.store.reset_for_retry(&tx_id);
    h.store.backdate(&tx_id, Duration::from_secs(600));

    let worker = h.recovery_worker(RecoveryConfig::default());
    let report = worker.scan_once().await?;
    assert_eq!(report.recovered, 1);

    assert!(db_a.committed_row("Account", "1").is_none(), "orphan undone");
    assert_eq!(h.store.status_of(&tx_id), Some(TxLogStatus::RolledBack));
    Ok(())
}
