//! Deterministic in-process fakes and wiring for cross-crate scenario
//! tests: a fake database participant with staged/committed state and
//! failure injection, a fake queue participant, an in-memory durable
//! journal store, and a harness that wires a full coordinator over the
//! in-memory KV backend.
//!
//! Nothing here touches the network; every scenario is reproducible.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sakti_config::{CoordinatorConfig, RecoveryConfig};
use sakti_core::{JournalPayload, ResourceKind, TxLogStatus, TxMetrics};
use sakti_engine::{
    Coordinator, InverseAction, Participant, ParticipantError, ParticipantRegistry, TxLogRow,
    TxLogStore,
};
use sakti_kv::{KvClient, MemoryKv};
use sakti_recovery::RecoveryWorker;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// FakeDatabase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum StagedOp {
    Put(Value),
    Delete,
}

#[derive(Default)]
struct FakeDbInner {
    committed: BTreeMap<String, Value>,
    staged: BTreeMap<String, StagedOp>,
    tx_open: bool,
    begin_calls: u32,
    commit_calls: u32,
    rollback_calls: u32,
    applied_inverses: Vec<String>,
    fail_commit: bool,
    probe_ok: bool,
    fail_inverse_ids: Vec<String>,
}

/// In-memory database participant.
///
/// Business writes are *staged* (`stage_put` / `stage_delete`) and only
/// become visible in `committed` when the coordinator commits the local
/// transaction, mirroring autocommit-off semantics. Inverse application
/// mutates committed state directly, as real compensation does.
pub struct FakeDatabase {
    name: String,
    inner: Mutex<FakeDbInner>,
}

impl FakeDatabase {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(FakeDbInner {
                probe_ok: true,
                ..Default::default()
            }),
        })
    }

    fn row_key(entity_class: &str, id: &str) -> String {
        format!("{entity_class}/{id}")
    }

    /// Stage an insert/update inside the open local transaction.
    pub fn stage_put(&self, entity_class: &str, id: &str, row: Value) {
        self.inner
            .lock()
            .unwrap()
            .staged
            .insert(Self::row_key(entity_class, id), StagedOp::Put(row));
    }

    /// Stage a delete inside the open local transaction.
    pub fn stage_delete(&self, entity_class: &str, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .staged
            .insert(Self::row_key(entity_class, id), StagedOp::Delete);
    }

    /// Put a row directly into committed state, bypassing the transaction
    /// (crash-scenario setup).
    pub fn force_committed(&self, entity_class: &str, id: &str, row: Value) {
        self.inner
            .lock()
            .unwrap()
            .committed
            .insert(Self::row_key(entity_class, id), row);
    }

    pub fn committed_row(&self, entity_class: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .committed
            .get(&Self::row_key(entity_class, id))
            .cloned()
    }

    pub fn committed_len(&self) -> usize {
        self.inner.lock().unwrap().committed.len()
    }

    pub fn commit_calls(&self) -> u32 {
        self.inner.lock().unwrap().commit_calls
    }

    pub fn rollback_calls(&self) -> u32 {
        self.inner.lock().unwrap().rollback_calls
    }

    pub fn applied_inverses(&self) -> Vec<String> {
        self.inner.lock().unwrap().applied_inverses.clone()
    }

    /// Make the next (and every) commit fail.
    pub fn fail_commit(&self, fail: bool) {
        self.inner.lock().unwrap().fail_commit = fail;
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.inner.lock().unwrap().probe_ok = ok;
    }

    /// Refuse inverse application for an entity id (compensation-failure
    /// scenarios).
    pub fn fail_inverse_on(&self, entity_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_inverse_ids
            .push(entity_id.to_string());
    }

    pub fn clear_inverse_failures(&self) {
        self.inner.lock().unwrap().fail_inverse_ids.clear();
    }
}

#[async_trait]
impl Participant for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    async fn begin(&self) -> Result<(), ParticipantError> {
        let mut st = self.inner.lock().unwrap();
        st.begin_calls += 1;
        st.tx_open = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), ParticipantError> {
        let mut st = self.inner.lock().unwrap();
        if !st.tx_open {
            return Err(ParticipantError::new("commit without open transaction"));
        }
        if st.fail_commit {
            return Err(ParticipantError::new(format!(
                "{} refused the commit",
                self.name
            )));
        }
        st.commit_calls += 1;
        st.tx_open = false;
        let staged: Vec<(String, StagedOp)> = std::mem::take(&mut st.staged).into_iter().collect();
        for (key, op) in staged {
            match op {
                StagedOp::Put(v) => {
                    st.committed.insert(key, v);
                }
                StagedOp::Delete => {
                    st.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ParticipantError> {
        let mut st = self.inner.lock().unwrap();
        st.rollback_calls += 1;
        st.tx_open = false;
        st.staged.clear();
        Ok(())
    }

    async fn probe(&self) -> Result<(), ParticipantError> {
        if self.inner.lock().unwrap().probe_ok {
            Ok(())
        } else {
            Err(ParticipantError::new(format!("{} probe refused", self.name)))
        }
    }

    async fn apply_inverse(&self, action: &InverseAction<'_>) -> Result<(), ParticipantError> {
        let mut st = self.inner.lock().unwrap();
        match action {
            InverseAction::DeleteById {
                entity_class,
                entity_id,
            } => {
                if st.fail_inverse_ids.iter().any(|id| id == entity_id) {
                    return Err(ParticipantError::new(format!(
                        "inverse delete of {entity_id} refused"
                    )));
                }
                st.committed.remove(&Self::row_key(entity_class, entity_id));
                st.applied_inverses.push(format!("delete:{entity_id}"));
            }
            InverseAction::RestoreImage {
                entity_class,
                entity_id,
                image,
            } => {
                let id = entity_id
                    .map(str::to_string)
                    .or_else(|| image.get("id").map(json_id))
                    .ok_or_else(|| ParticipantError::new("restore without id"))?;
                if st.fail_inverse_ids.iter().any(|i| *i == id) {
                    return Err(ParticipantError::new(format!(
                        "inverse restore of {id} refused"
                    )));
                }
                st.committed
                    .insert(Self::row_key(entity_class, &id), (*image).clone());
                st.applied_inverses.push(format!("restore:{id}"));
            }
            InverseAction::RestoreRows { entity_class, rows } => {
                for row in *rows {
                    let id = row
                        .get("id")
                        .map(json_id)
                        .ok_or_else(|| ParticipantError::new("bulk restore row without id"))?;
                    st.committed
                        .insert(Self::row_key(entity_class, &id), row.clone());
                    st.applied_inverses.push(format!("restore:{id}"));
                }
            }
            InverseAction::ExecuteSql { sql, .. } => {
                st.applied_inverses.push(format!("sql:{sql}"));
            }
            InverseAction::CallProcedure { name, .. } => {
                st.applied_inverses.push(format!("call:{name}"));
            }
        }
        Ok(())
    }
}

fn json_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// FakeQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeQueueInner {
    buffered: Vec<(String, Value)>,
    delivered: Vec<(String, Value)>,
}

/// Queue participant: messages buffer inside the local transaction and are
/// delivered on commit, dropped on rollback. Queue operations carry no
/// before-images; they are not recoverable and never journaled by the
/// engine itself.
pub struct FakeQueue {
    name: String,
    inner: Mutex<FakeQueueInner>,
}

impl FakeQueue {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(FakeQueueInner::default()),
        })
    }

    pub fn enqueue(&self, topic: &str, payload: Value) {
        self.inner
            .lock()
            .unwrap()
            .buffered
            .push((topic.to_string(), payload));
    }

    pub fn delivered(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().delivered.clone()
    }
}

#[async_trait]
impl Participant for FakeQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Queue
    }

    async fn begin(&self) -> Result<(), ParticipantError> {
        Ok(())
    }

    async fn commit(&self) -> Result<(), ParticipantError> {
        let mut st = self.inner.lock().unwrap();
        let buffered = std::mem::take(&mut st.buffered);
        st.delivered.extend(buffered);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ParticipantError> {
        self.inner.lock().unwrap().buffered.clear();
        Ok(())
    }

    async fn probe(&self) -> Result<(), ParticipantError> {
        Ok(())
    }

    async fn apply_inverse(&self, _action: &InverseAction<'_>) -> Result<(), ParticipantError> {
        // Nothing to undo: a queue message either went out at commit or
        // never left the buffer.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTxLogStore
// ---------------------------------------------------------------------------

/// In-memory [`TxLogStore`] with crash-scenario helpers.
#[derive(Default)]
pub struct MemoryTxLogStore {
    rows: Mutex<HashMap<String, TxLogRow>>,
}

impl MemoryTxLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, tx_id: &str) -> Option<TxLogStatus> {
        self.rows.lock().unwrap().get(tx_id).map(|r| r.status)
    }

    pub fn row(&self, tx_id: &str) -> Option<TxLogRow> {
        self.rows.lock().unwrap().get(tx_id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn all_rows(&self) -> Vec<TxLogRow> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    /// Seed a row as a crashed coordinator would have left it.
    pub fn seed_row(&self, tx_id: &str, status: TxLogStatus, payload: JournalPayload) {
        self.rows.lock().unwrap().insert(
            tx_id.to_string(),
            TxLogRow {
                tx_id: tx_id.to_string(),
                business_key: format!("bk-{tx_id}"),
                status,
                created_at: Utc::now(),
                last_update: Utc::now(),
                retry_count: 0,
                last_retry_at: None,
                payload,
            },
        );
    }

    /// Push a row's `last_update` into the past so it qualifies as stalled.
    pub fn backdate(&self, tx_id: &str, by: Duration) {
        if let Some(r) = self.rows.lock().unwrap().get_mut(tx_id) {
            r.last_update = Utc::now() - ChronoDuration::from_std(by).expect("duration in range");
        }
    }

    /// Operator action: put a FAILED row back in front of the recovery
    /// worker.
    pub fn reset_for_retry(&self, tx_id: &str) {
        if let Some(r) = self.rows.lock().unwrap().get_mut(tx_id) {
            r.status = TxLogStatus::Pending;
            r.retry_count = 0;
        }
    }
}

#[async_trait]
impl TxLogStore for MemoryTxLogStore {
    async fn open_pending(&self, tx_id: &str, business_key: &str) -> anyhow::Result<()> {
        self.rows
            .lock()
            .unwrap()
            .entry(tx_id.to_string())
            .or_insert_with(|| TxLogRow {
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

    async fn record_payload(&self, tx_id: &str, payload: &JournalPayload) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(tx_id) {
            r.payload = payload.clone();
            r.last_update = Utc::now();
        }
        Ok(())
    }

    async fn mark_status(
        &self,
        tx_id: &str,
        status: TxLogStatus,
        payload: Option<&JournalPayload>,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(r) = rows.get_mut(tx_id) {
            r.status = status;
            if let Some(p) = payload {
                r.payload = p.clone();
            }
            r.last_update = Utc::now();
        }
        Ok(())
    }

    async fn fetch(&self, tx_id: &str) -> anyhow::Result<Option<TxLogRow>> {
        Ok(self.rows.lock().unwrap().get(tx_id).cloned())
    }

    async fn list_stalled(&self, stall: Duration, limit: i64) -> anyhow::Result<Vec<TxLogRow>> {
        let cutoff = Utc::now() - ChronoDuration::from_std(stall).expect("duration in range");
        let mut rows: Vec<TxLogRow> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                matches!(r.status, TxLogStatus::Pending | TxLogStatus::RollingBack)
                    && r.last_update < cutoff
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.last_update);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn bump_retry(&self, tx_id: &str) -> anyhow::Result<i32> {
        let mut rows = self.rows.lock().unwrap();
        let r = rows
            .get_mut(tx_id)
            .ok_or_else(|| anyhow::anyhow!("no tx_log row for {tx_id}"))?;
        r.retry_count += 1;
        r.last_retry_at = Some(Utc::now());
        r.last_update = Utc::now();
        Ok(r.retry_count)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A fully wired coordinator over in-memory backends.
pub struct Harness {
    pub coordinator: Coordinator,
    pub kv: Arc<MemoryKv>,
    pub store: Arc<MemoryTxLogStore>,
    pub metrics: Arc<TxMetrics>,
    pub registry: Arc<ParticipantRegistry>,
    pub config: CoordinatorConfig,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// A recovery worker sharing this harness's registry, store, KV and
    /// metrics.
    pub fn recovery_worker(&self, recovery: RecoveryConfig) -> RecoveryWorker {
        RecoveryWorker::new(
            recovery,
            Arc::clone(&self.registry),
            Arc::clone(&self.store) as Arc<dyn TxLogStore>,
            Arc::clone(&self.kv) as Arc<dyn KvClient>,
            self.config.lock.prefix.clone(),
            self.config.degrade.on_kv_outage,
            Arc::clone(&self.metrics),
        )
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    config: Option<CoordinatorConfig>,
    participants: Vec<Arc<dyn Participant>>,
}

impl HarnessBuilder {
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn register<P: Participant + 'static>(mut self, participant: Arc<P>) -> Self {
        let participant: Arc<dyn Participant> = participant;
        self.participants.push(participant);
        self
    }

    pub fn build(self) -> Harness {
        init_test_tracing();

        // Short waits by default so contention scenarios stay fast.
        let config = self.config.unwrap_or_else(|| {
            let mut c = CoordinatorConfig::default();
            c.lock.wait_ms = 200;
            c
        });

        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryTxLogStore::new());
        let metrics = Arc::new(TxMetrics::new());

        let mut registry = ParticipantRegistry::new();
        for p in self.participants {
            registry.register(p);
        }
        let registry = Arc::new(registry);

        let coordinator = Coordinator::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&kv) as Arc<dyn KvClient>,
            Arc::clone(&store) as Arc<dyn TxLogStore>,
            Arc::clone(&metrics),
        );

        Harness {
            coordinator,
            kv,
            store,
            metrics,
            registry,
            config,
        }
    }
}

/// Scenario logging, opt-in via `RUST_LOG`. Safe to call from every test;
/// only the first caller installs the subscriber.
fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn staged_rows_only_commit_on_commit() {
        let db = FakeDatabase::new("dbA");
        db.begin().await.unwrap();
        db.stage_put("Account", "1", json!({"id": "1"}));
        assert!(db.committed_row("Account", "1").is_none());

        db.commit().await.unwrap();
        assert!(db.committed_row("Account", "1").is_some());
    }

    #[tokio::test]
    async fn rollback_drops_staged_rows() {
        let db = FakeDatabase::new("dbA");
        db.begin().await.unwrap();
        db.stage_put("Account", "1", json!({"id": "1"}));
        db.rollback().await.unwrap();
        db.begin().await.unwrap();
        db.commit().await.unwrap();
        assert_eq!(db.committed_len(), 0);
    }

    #[tokio::test]
    async fn queue_delivers_on_commit_and_drops_on_rollback() {
        let q = FakeQueue::new("events");
        q.enqueue("settlement", json!({"tx": 1}));
        assert!(q.delivered().is_empty());
        q.commit().await.unwrap();
        assert_eq!(q.delivered().len(), 1);

        q.enqueue("settlement", json!({"tx": 2}));
        q.rollback().await.unwrap();
        q.commit().await.unwrap();
        assert_eq!(q.delivered().len(), 1, "rolled-back message never delivered");
    }
}
