//! Journal persistence seam.
//!
//! Cold half: the durable `tx_log` row behind [`TxLogStore`], the recovery
//! backbone. Hot half: a best-effort KV mirror under `sakti:txlog:<tx_id>`
//! so operators can inspect in-flight journals without touching the
//! database. Mirror failures are logged and never abort a transaction.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sakti_core::{JournalPayload, TxLogStatus};
use sakti_kv::{keyspace, KvClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Hot mirror TTL. Generous enough to outlive any sane transaction, short
/// enough that dead mirrors drain on their own.
const HOT_MIRROR_TTL: Duration = Duration::from_secs(3_600);

// ---------------------------------------------------------------------------
// Durable row
// ---------------------------------------------------------------------------

/// One `tx_log` row.
#[derive(Debug, Clone)]
pub struct TxLogRow {
    pub tx_id: String,
    pub business_key: String,
    pub status: TxLogStatus,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub payload: JournalPayload,
}

/// Durable journal store.
///
/// Row ownership: a `tx_log` row is updated only by the owning transaction
/// or by the recovery worker under its advisory lock.
#[async_trait]
pub trait TxLogStore: Send + Sync {
    /// Create the PENDING row for a fresh transaction (idempotent).
    async fn open_pending(&self, tx_id: &str, business_key: &str) -> Result<()>;

    /// Persist the current journal payload without changing status.
    async fn record_payload(&self, tx_id: &str, payload: &JournalPayload) -> Result<()>;

    /// Transition the row's status, optionally refreshing the payload.
    async fn mark_status(
        &self,
        tx_id: &str,
        status: TxLogStatus,
        payload: Option<&JournalPayload>,
    ) -> Result<()>;

    async fn fetch(&self, tx_id: &str) -> Result<Option<TxLogRow>>;

    /// Recovery-eligible rows: PENDING or ROLLING_BACK, with `last_update`
    /// older than `stall`. Ordered by `last_update` ascending (stalest
    /// first).
    async fn list_stalled(&self, stall: Duration, limit: i64) -> Result<Vec<TxLogRow>>;

    /// Increment `retry_count`, stamp `last_retry_at`; returns the new count.
    async fn bump_retry(&self, tx_id: &str) -> Result<i32>;
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Cold store + hot mirror, as one write surface for the coordinator.
pub struct JournalWriter {
    store: Arc<dyn TxLogStore>,
    kv: Arc<dyn KvClient>,
}

impl JournalWriter {
    pub fn new(store: Arc<dyn TxLogStore>, kv: Arc<dyn KvClient>) -> Self {
        Self { store, kv }
    }

    pub fn store(&self) -> &Arc<dyn TxLogStore> {
        &self.store
    }

    pub async fn open(&self, tx_id: &str, business_key: &str) -> Result<()> {
        self.store.open_pending(tx_id, business_key).await
    }

    /// Persist the payload and refresh the hot mirror.
    pub async fn flush(&self, tx_id: &str, payload: &JournalPayload) -> Result<()> {
        self.store.record_payload(tx_id, payload).await?;
        self.mirror(tx_id, payload).await;
        Ok(())
    }

    /// Terminal (or rolling-back) status write. Terminal statuses drop the
    /// hot mirror; `ROLLING_BACK` keeps it current for operators watching
    /// the rollback.
    pub async fn close(
        &self,
        tx_id: &str,
        status: TxLogStatus,
        payload: &JournalPayload,
    ) -> Result<()> {
        self.store.mark_status(tx_id, status, Some(payload)).await?;
        if status.is_terminal() {
            if let Err(e) = self.kv.del(&mirror_key(tx_id)).await {
                warn!(tx_id, error = %e, "journal hot mirror delete failed");
            }
        } else {
            self.mirror(tx_id, payload).await;
        }
        Ok(())
    }

    async fn mirror(&self, tx_id: &str, payload: &JournalPayload) {
        let body = payload.to_value().to_string();
        if let Err(e) = self
            .kv
            .set_ex(&mirror_key(tx_id), &body, HOT_MIRROR_TTL)
            .await
        {
            warn!(tx_id, error = %e, "journal hot mirror write failed");
        }
    }
}

fn mirror_key(tx_id: &str) -> String {
    format!("{}{}", keyspace::TXLOG, tx_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sakti_core::{OperationEntry, OperationKind};
    use sakti_kv::MemoryKv;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal in-process store for writer tests.
    #[derive(Default)]
    struct MapStore {
        rows: Mutex<HashMap<String, TxLogRow>>,
    }

    #[async_trait]
    impl TxLogStore for MapStore {
        async fn open_pending(&self, tx_id: &str, business_key: &str) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.entry(tx_id.to_string()).or_insert_with(|| TxLogRow {
                tx_id: tx_id.to_string(),
                business_key: business_key.to_string(),
                status: TxLogStatus::Pending,
                created_at: Utc::now(),
                last_update: Utc::now(),
                retry_count: 0,
                last_retry_at: None,
                payload: JournalPayload::new(),
            });
            Ok(())
        }

        async fn record_payload(&self, tx_id: &str, payload: &JournalPayload) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(tx_id).expect("row opened");
            row.payload = payload.clone();
            row.last_update = Utc::now();
            Ok(())
        }

        async fn mark_status(
            &self,
            tx_id: &str,
            status: TxLogStatus,
            payload: Option<&JournalPayload>,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(tx_id).expect("row opened");
            row.status = status;
            if let Some(p) = payload {
                row.payload = p.clone();
            }
            row.last_update = Utc::now();
            Ok(())
        }

        async fn fetch(&self, tx_id: &str) -> Result<Option<TxLogRow>> {
            Ok(self.rows.lock().unwrap().get(tx_id).cloned())
        }

        async fn list_stalled(&self, _stall: Duration, _limit: i64) -> Result<Vec<TxLogRow>> {
            Ok(vec![])
        }

        async fn bump_retry(&self, tx_id: &str) -> Result<i32> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(tx_id).expect("row opened");
            row.retry_count += 1;
            row.last_retry_at = Some(Utc::now());
            Ok(row.retry_count)
        }
    }

    fn payload_with_one_insert() -> JournalPayload {
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
    }

    #[tokio::test]
    async fn flush_writes_cold_row_and_hot_mirror() {
        let store = Arc::new(MapStore::default());
        let kv = Arc::new(MemoryKv::new());
        let writer = JournalWriter::new(
            Arc::clone(&store) as Arc<dyn TxLogStore>,
            Arc::clone(&kv) as Arc<dyn KvClient>,
        );

        writer.open("tx-1", "bk").await.unwrap();
        writer.flush("tx-1", &payload_with_one_insert()).await.unwrap();

        let row = store.fetch("tx-1").await.unwrap().unwrap();
        assert_eq!(row.payload.entries.len(), 1);
        assert!(kv.get("sakti:txlog:tx-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_close_drops_hot_mirror() {
        let store = Arc::new(MapStore::default());
        let kv = Arc::new(MemoryKv::new());
        let writer = JournalWriter::new(
            Arc::clone(&store) as Arc<dyn TxLogStore>,
            Arc::clone(&kv) as Arc<dyn KvClient>,
        );

        writer.open("tx-1", "bk").await.unwrap();
        let p = payload_with_one_insert();
        writer.flush("tx-1", &p).await.unwrap();
        writer.close("tx-1", TxLogStatus::Committed, &p).await.unwrap();

        let row = store.fetch("tx-1").await.unwrap().unwrap();
        assert_eq!(row.status, TxLogStatus::Committed);
        assert_eq!(kv.get("sakti:txlog:tx-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_outage_does_not_fail_the_flush() {
        let store = Arc::new(MapStore::default());
        let kv = Arc::new(MemoryKv::new());
        let writer = JournalWriter::new(
            Arc::clone(&store) as Arc<dyn TxLogStore>,
            Arc::clone(&kv) as Arc<dyn KvClient>,
        );

        writer.open("tx-1", "bk").await.unwrap();
        kv.set_online(false);
        writer
            .flush("tx-1", &payload_with_one_insert())
            .await
            .expect("mirror failure must not abort the transaction");
    }
}
