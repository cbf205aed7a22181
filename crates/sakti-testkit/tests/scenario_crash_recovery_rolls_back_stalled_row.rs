use sakti_config::RecoveryConfig;
use sakti_core::{
    InverseDescriptor, JournalPayload, OperationEntry, OperationKind, TxLogStatus,
};
use sakti_testkit::{FakeDatabase, Harness};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn crashed_payload() -> JournalPayload {
    let mut p = JournalPayload::new();
    p.push(OperationEntry {
        sequence: 1,
        datasource: "dbA".to_string(),
        op: OperationKind::Insert,
        entity_class: "Account".to_string(),
        entity_id: Some("1".to_string()),
        before_image: None,
        inverse: None,
        compensated: false,
        compensation_error: None,
    });
    p.push(OperationEntry {
        sequence: 2,
        datasource: "dbB".to_string(),
        op: OperationKind::Update,
        entity_class: "Balance".to_string(),
        entity_id: Some("2".to_string()),
        before_image: Some(json!({"id": "2", "balance": 100})),
        inverse: Some(InverseDescriptor::RestoreBeforeImage),
        compensated: false,
        compensation_error: None,
    });
    p
}

/// The process died mid-COMMITTING: dbA's local transaction committed,
/// dbB's never did. On restart the recovery worker finds the PENDING row
/// past the stall threshold, replays the inverses and marks ROLLED_BACK.
#[tokio::test]
async fn restart_recovers_pending_row_left_mid_commit() -> anyhow::Result<()> {
    let db_a = FakeDatabase::new("dbA");
    let db_b = FakeDatabase::new("dbB");
    let h = Harness::builder()
        .register(Arc::clone(&db_a))
        .register(Arc::clone(&db_b))
        .build();

    // State as the crash left it: dbA row visible, dbB untouched at its
    // old balance, PENDING journal row gone quiet.
    db_a.force_committed("Account", "1", json!({"id": "1", "balance": 50}));
    db_b.force_committed("Balance", "2", json!({"id": "2", "balance": 100}));
    h.store.seed_row("tx-crashed", TxLogStatus::Pending, crashed_payload());
    h.store.backdate("tx-crashed", Duration::from_secs(600));

    let worker = h.recovery_worker(RecoveryConfig::default());
    let report = worker.scan_once().await?;

    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 0);

    // dbA's committed insert deleted; dbB's balance re-asserted from the
    // before-image (idempotent; the update never applied there anyway).
    assert!(db_a.committed_row("Account", "1").is_none());
    assert_eq!(
        db_b.committed_row("Balance", "2").unwrap()["balance"],
        json!(100)
    );

    let row = h.store.row("tx-crashed").unwrap();
    assert_eq!(row.status, TxLogStatus::RolledBack);
    assert!(row.payload.entries.iter().all(|e| e.compensated));

    // Next scan is a no-op: the row is terminal.
    let report = worker.scan_once().await?;
    assert_eq!(report.scanned, 0);
    Ok(())
}

/// Recovery convergence: with a retry budget of `n`, a row that keeps
/// failing compensation reaches FAILED within `n` scans and stays there.
#[tokio::test]
async fn unrecoverable_row_converges_to_failed_within_retry_budget() -> anyhow::Result<()> {
    let db_a = FakeDatabase::new("dbA");
    db_a.force_committed("Account", "1", json!({"id": "1"}));
    db_a.fail_inverse_on("1");

    let h = Harness::builder().register(Arc::clone(&db_a)).build();
    h.store.seed_row("tx-stuck", TxLogStatus::Pending, {
        let mut p = JournalPayload::new();
        p.push(OperationEntry {
            sequence: 1,
            datasource: "dbA".to_string(),
            op: OperationKind::Insert,
            entity_class: "Account".to_string(),
            entity_id: Some("1".to_string()),
            before_image: None,
            inverse: None,
            compensated: false,
            compensation_error: None,
        });
        p
    });

    let worker = h.recovery_worker(RecoveryConfig {
        max_retries: 3,
        ..RecoveryConfig::default()
    });

    let mut scans = 0;
    loop {
        h.store.backdate("tx-stuck", Duration::from_secs(600));
        let report = worker.scan_once().await?;
        scans += 1;
        assert!(scans <= 4, "must converge within the retry budget");
        if report.failed == 1 {
            break;
        }
        if report.scanned == 0 {
            panic!("row disappeared from the scan set before reaching FAILED");
        }
    }

    let row = h.store.row("tx-stuck").unwrap();
    assert_eq!(row.status, TxLogStatus::Failed);
    assert!(row.payload.entries[0]
        .compensation_error
        .as_deref()
        .unwrap()
        .contains("refused"));
    Ok(())
}
