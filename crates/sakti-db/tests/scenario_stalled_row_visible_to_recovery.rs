use sakti_core::{JournalPayload, OperationEntry, OperationKind, TxLogStatus};
use sakti_engine::TxLogStore;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn stalled_pending_row_is_listed_and_retries_are_counted() -> anyhow::Result<()> {
    // Skip if no DB configured.
    if std::env::var(sakti_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: SAKTI_DATABASE_URL not set");
        return Ok(());
    }

    let pool = sakti_db::connect_from_env().await?;
    sakti_db::migrate(&pool).await?;
    let store = sakti_db::PgTxLogStore::new(pool.clone());

    let tx_id = format!("tx-{}", Uuid::new_v4());
    store.open_pending(&tx_id, "transfer-47").await?;

    let mut payload = JournalPayload::new();
    payload.push(OperationEntry {
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
    store.record_payload(&tx_id, &payload).await?;

    // Fresh row: not stalled yet.
    let stalled = store.list_stalled(Duration::from_secs(300), 10).await?;
    assert!(!stalled.iter().any(|r| r.tx_id == tx_id));

    // Backdate the row past the stall threshold, as a crashed coordinator
    // would leave it.
    sqlx::query("update tx_log set last_update = now() - interval '10 minutes' where tx_id = $1")
        .bind(&tx_id)
        .execute(&pool)
        .await?;

    let stalled = store.list_stalled(Duration::from_secs(300), 10).await?;
    let row = stalled
        .iter()
        .find(|r| r.tx_id == tx_id)
        .expect("stalled row visible to recovery");
    assert_eq!(row.status, TxLogStatus::Pending);
    assert_eq!(row.payload.entries.len(), 1);

    assert_eq!(store.bump_retry(&tx_id).await?, 1);
    assert_eq!(store.bump_retry(&tx_id).await?, 2);

    // bump_retry refreshes last_update, so the row leaves the stalled set
    // until it idles past the threshold again.
    let stalled = store.list_stalled(Duration::from_secs(300), 10).await?;
    assert!(!stalled.iter().any(|r| r.tx_id == tx_id));

    store
        .mark_status(&tx_id, TxLogStatus::RolledBack, Some(&payload))
        .await?;
    let row = store.fetch(&tx_id).await?.expect("row exists");
    assert_eq!(row.status, TxLogStatus::RolledBack);
    assert_eq!(row.retry_count, 2);

    // cleanup
    sqlx::query("delete from tx_log where tx_id = $1")
        .bind(&tx_id)
        .execute(&pool)
        .await?;
    Ok(())
}
