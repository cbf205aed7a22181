use sakti_core::{OperationKind, TxErrorKind, TxLogStatus};
use sakti_engine::ExecuteRequest;
use sakti_kv::KvClient;
use sakti_testkit::{FakeDatabase, Harness};
use serde_json::json;
use std::sync::Arc;

/// dbB stops answering its connectivity probe before commit. Validation
/// must refuse PREPARED, and since nothing committed yet, both databases
/// end up untouched with the journal ROLLED_BACK.
#[tokio::test]
async fn unreachable_database_fails_validation_and_rolls_back() -> anyhow::Result<()> {
    let db_a = FakeDatabase::new("dbA");
    let db_b = FakeDatabase::new("dbB");
    let h = Harness::builder()
        .register(Arc::clone(&db_a))
        .register(Arc::clone(&db_b))
        .build();

    let err = h
        .coordinator
        .execute(
            ExecuteRequest::new("acct-5", "transfer-005").with_idempotency_key("transfer-005"),
            |tx| {
                let db_a = Arc::clone(&db_a);
                let db_b = Arc::clone(&db_b);
                async move {
                    tx.enlist_database("dbA").await?;
                    tx.enlist_database("dbB").await?;
                    db_a.stage_put("Account", "1", json!({"id": "1"}));
                    tx.record_entity_op("dbA", OperationKind::Insert, "Account", Some("1".into()), None)?;
                    tx.mark_prepared("dbA")?;
                    tx.mark_prepared("dbB")?;
                    // dbB dies after the writes, before validation.
                    db_b.set_probe_ok(false);
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

    let tx_err = err.as_tx().unwrap();
    assert_eq!(tx_err.kind(), TxErrorKind::ValidationFailed);
    assert!(tx_err.message().contains("DB_UNREACHABLE"));
    assert!(tx_err.kind().is_retryable(), "retryable after remediation");

    // Neither database committed.
    assert_eq!(db_a.commit_calls(), 0);
    assert_eq!(db_b.commit_calls(), 0);
    assert_eq!(db_a.committed_len(), 0);
    assert!(db_a.applied_inverses().is_empty(), "nothing to compensate");

    let rows = h.store.all_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TxLogStatus::RolledBack);

    // Idempotency rolled back for a clean retry.
    assert_eq!(h.kv.get("sakti:idemp:transfer-005").await?, None);
    Ok(())
}
