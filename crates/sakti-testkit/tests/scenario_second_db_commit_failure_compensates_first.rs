use sakti_core::{OperationKind, TxErrorKind, TxLogStatus};
use sakti_engine::ExecuteRequest;
use sakti_kv::KvClient;
use sakti_testkit::{FakeDatabase, Harness};
use serde_json::json;
use std::sync::Arc;

/// Two enlisted databases; the second refuses its commit. The first has
/// already committed, so its insert must be undone via the journal inverse,
/// and the caller must see PARTICIPANT_COMMIT_FAILED with everything
/// rolled back.
#[tokio::test]
async fn second_commit_failure_undoes_first_database() -> anyhow::Result<()> {
    let db_a = FakeDatabase::new("dbA");
    let db_b = FakeDatabase::new("dbB");
    db_b.force_committed("Balance", "2", json!({"id": "2", "balance": 100}));
    db_b.fail_commit(true);

    let h = Harness::builder()
        .register(Arc::clone(&db_a))
        .register(Arc::clone(&db_b))
        .build();

    let req = ExecuteRequest::new("acct-12", "transfer-002").with_idempotency_key("transfer-002");
    let err = h
        .coordinator
        .execute(req, |tx| {
            let db_a = Arc::clone(&db_a);
            let db_b = Arc::clone(&db_b);
            async move {
                tx.enlist_database("dbA").await?;
                tx.enlist_database("dbB").await?;

                db_a.stage_put("Account", "1", json!({"id": "1", "balance": 50}));
                tx.record_entity_op("dbA", OperationKind::Insert, "Account", Some("1".into()), None)?;

                db_b.stage_put("Balance", "2", json!({"id": "2", "balance": 250}));
                tx.record_entity_op(
                    "dbB",
                    OperationKind::Update,
                    "Balance",
                    Some("2".into()),
                    Some(json!({"id": "2", "balance": 100})),
                )?;

                tx.mark_prepared("dbA")?;
                tx.mark_prepared("dbB")?;
                Ok(tx.tx_id())
            }
        })
        .await
        .unwrap_err();

    let tx_err = err.as_tx().expect("engine-classified failure");
    assert_eq!(tx_err.kind(), TxErrorKind::ParticipantCommitFailed);
    assert!(tx_err.message().contains("dbB"));

    // dbA committed first, then its insert was deleted by the compensator.
    assert_eq!(db_a.commit_calls(), 1);
    assert!(db_a.committed_row("Account", "1").is_none());
    assert_eq!(db_a.applied_inverses(), vec!["delete:1"]);

    // dbB never committed; its staged update vanished with the local
    // rollback and its pre-existing row is untouched.
    assert_eq!(db_b.commit_calls(), 0);
    assert!(db_b.rollback_calls() >= 1);
    assert_eq!(
        db_b.committed_row("Balance", "2").unwrap()["balance"],
        json!(100)
    );
    assert!(db_b.applied_inverses().is_empty());

    // Journal rolled back; idempotency marker deleted so a retry may run.
    let rows = h.store.all_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TxLogStatus::RolledBack);
    assert!(rows[0]
        .payload
        .error
        .as_deref()
        .unwrap()
        .contains("PARTICIPANT_COMMIT_FAILED"));
    assert!(rows[0].payload.entries.iter().all(|e| e.compensated));
    assert_eq!(h.kv.get("sakti:idemp:transfer-002").await?, None);

    let m = h.metrics.snapshot();
    assert_eq!(m.rolled_back, 1);
    assert_eq!(m.committed, 0);
    assert_eq!(m.compensation_attempts, 1);
    assert_eq!(m.compensation_successes, 1);
    Ok(())
}
