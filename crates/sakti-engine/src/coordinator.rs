//! Phase coordinator.
//!
//! # Design
//!
//! One [`Coordinator::execute`] call is one distributed business operation:
//!
//! 1. idempotency fast-fail, lock acquisition, idempotency anti-race;
//! 2. context opened, `CREATED → COLLECTING`, durable PENDING row written;
//! 3. the business closure runs with a [`TxHandle`], enlisting resources
//!    and recording journal entries;
//! 4. `COLLECTING → VALIDATING`, pre-commit checks;
//! 5. `VALIDATING → PREPARED → COMMITTING`, participants commit in
//!    enlistment order;
//! 6. `COMMITTING → COMMITTED`, or the rollback path: local rollback of
//!    uncommitted participants, inverse replay for committed ones,
//!    `ROLLING_BACK → ROLLED_BACK | FAILED`.
//!
//! The lock is released on every exit path. The context is bound to the
//! executing task for the closure's duration (task-local), so a nested
//! `execute` *joins* the transaction instead of starting a second one:
//! no re-acquired lock, no second idempotency marker, no phase reset.
//! Binding is scoped, so it cannot leak past the closure.

use crate::compensator::CompensatingExecutor;
use crate::journal::{JournalWriter, TxLogStore};
use crate::participant::ParticipantRegistry;
use crate::validator::{PreCommitValidator, ValidationCheck};
use sakti_config::CoordinatorConfig;
use sakti_core::{
    CaptureBuffer, CapturedEntity, ContextSnapshot, DraftOperation, JournalPayload, OperationKind,
    RiskFlag, TxContext, TxError, TxLogStatus, TxMetrics, TxPhase,
};
use sakti_kv::{IdempotencyStore, KvClient, LockHandle, LockManager};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Shared per-transaction state
// ---------------------------------------------------------------------------

struct TxState {
    ctx: TxContext,
    payload: JournalPayload,
    capture: CaptureBuffer,
}

type SharedTx = Arc<Mutex<TxState>>;

tokio::task_local! {
    static CURRENT_TX: SharedTx;
}

// ---------------------------------------------------------------------------
// Public request / error types
// ---------------------------------------------------------------------------

/// Parameters of one coordinated execution.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub lock_key: String,
    /// `None` disables idempotency protection for this call.
    pub idempotency_key: Option<String>,
    pub business_key: String,
    /// Override of `lock.wait_ms`.
    pub wait: Option<Duration>,
    /// Override of `lock.lease_ms`.
    pub lease: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(lock_key: impl Into<String>, business_key: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key.into(),
            idempotency_key: None,
            business_key: business_key.into(),
            wait: None,
            lease: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// What a caller of [`Coordinator::execute`] can get back.
///
/// `Tx` carries the engine taxonomy. `Business` carries the closure's own
/// failure after a successful rollback: the originating cause, exactly as
/// thrown. A business failure whose rollback also failed surfaces as
/// `Tx(COMPENSATION_FAILED)` instead.
#[derive(Debug)]
pub enum ExecuteError {
    Tx(TxError),
    Business(anyhow::Error),
}

impl ExecuteError {
    pub fn as_tx(&self) -> Option<&TxError> {
        match self {
            ExecuteError::Tx(e) => Some(e),
            ExecuteError::Business(_) => None,
        }
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Tx(e) => write!(f, "{e}"),
            ExecuteError::Business(e) => write!(f, "rolled back: {e}"),
        }
    }
}

impl std::error::Error for ExecuteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecuteError::Tx(e) => Some(e),
            ExecuteError::Business(e) => Some(e.as_ref()),
        }
    }
}

impl From<TxError> for ExecuteError {
    fn from(e: TxError) -> Self {
        ExecuteError::Tx(e)
    }
}

fn classify_business(err: anyhow::Error) -> ExecuteError {
    match err.downcast::<TxError>() {
        Ok(tx) => ExecuteError::Tx(tx),
        Err(other) => ExecuteError::Business(other),
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    registry: Arc<ParticipantRegistry>,
    locks: LockManager,
    idempotency: IdempotencyStore,
    validator: PreCommitValidator,
    journal: JournalWriter,
    compensator: CompensatingExecutor,
    metrics: Arc<TxMetrics>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ParticipantRegistry>,
        kv: Arc<dyn KvClient>,
        store: Arc<dyn TxLogStore>,
        metrics: Arc<TxMetrics>,
    ) -> Self {
        let locks = LockManager::new(
            Arc::clone(&kv),
            config.lock.prefix.clone(),
            config.degrade.on_kv_outage,
        );
        let idempotency = IdempotencyStore::new(
            Arc::clone(&kv),
            config.idempotency.prefix.clone(),
            config.idempotency.ttl(),
        );
        let validator = PreCommitValidator::new(
            Arc::clone(&registry),
            config.validation.long_running_threshold(),
        );
        let journal = JournalWriter::new(store, kv);
        let compensator = CompensatingExecutor::new(Arc::clone(&registry), Arc::clone(&metrics));

        Self {
            registry,
            locks,
            idempotency,
            validator,
            journal,
            compensator,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> Arc<TxMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The `tx_id` bound to the current task, if any.
    pub fn current_tx_id() -> Option<String> {
        CURRENT_TX
            .try_with(|s| s.lock().expect("tx state poisoned").ctx.tx_id().to_string())
            .ok()
    }

    /// Run `f` as one distributed transaction.
    ///
    /// If the current task is already executing a transaction, this call
    /// joins it: `f` runs against the existing context and the outer call
    /// owns commit, rollback, lock and idempotency.
    pub async fn execute<T, F, Fut>(&self, req: ExecuteRequest, f: F) -> Result<T, ExecuteError>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Ok(shared) = CURRENT_TX.try_with(Arc::clone) {
            let handle = TxHandle {
                shared,
                registry: Arc::clone(&self.registry),
            };
            return f(handle).await.map_err(classify_business);
        }

        self.metrics.record_started();

        // Idempotency fast-fail, before any lock work.
        let mut idempotency_bypassed = false;
        if let Some(key) = req.idempotency_key.as_deref() {
            match self.check_duplicate(key).await? {
                IdempotencyProbe::Duplicate => {
                    return Err(self.reject_duplicate(key));
                }
                IdempotencyProbe::Bypassed => idempotency_bypassed = true,
                IdempotencyProbe::Absent => {}
            }
        }

        let wait = req.wait.unwrap_or_else(|| self.config.lock.wait());
        let lease = req.lease.unwrap_or_else(|| self.config.lock.lease());
        let lock = match self.locks.try_lock(&req.lock_key, wait, lease).await {
            Ok(h) => h,
            Err(e) => {
                self.metrics.record_lock_unavailable();
                return Err(TxError::lock_unavailable(e.to_string()).into());
            }
        };
        if !lock.is_acquired() && !lock.is_degraded() {
            self.metrics.record_lock_unavailable();
            return Err(TxError::lock_unavailable(format!(
                "lock '{}' not acquired within {} ms",
                req.lock_key,
                wait.as_millis()
            ))
            .into());
        }

        let result = self.run_locked(&req, &lock, idempotency_bypassed, f).await;
        lock.release().await;
        result
    }

    /// Open a transaction on the manual capture surface: no lock, no
    /// idempotency marker; the integrator drives commit/rollback itself.
    pub async fn begin(&self, business_key: &str) -> Result<ManualTx<'_>, TxError> {
        self.metrics.record_started();
        let shared = self.open_context(business_key, None).await?;
        let tx_id = shared
            .lock()
            .expect("tx state poisoned")
            .ctx
            .tx_id()
            .to_string();
        Ok(ManualTx {
            coordinator: self,
            handle: TxHandle {
                shared,
                registry: Arc::clone(&self.registry),
            },
            tx_id,
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle internals
    // ------------------------------------------------------------------

    async fn run_locked<T, F, Fut>(
        &self,
        req: &ExecuteRequest,
        lock: &LockHandle,
        mut idempotency_bypassed: bool,
        f: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Anti-race: the same key may have been recorded while we waited
        // for the lock.
        if let Some(key) = req.idempotency_key.as_deref() {
            if !idempotency_bypassed {
                match self.check_duplicate(key).await? {
                    IdempotencyProbe::Duplicate => return Err(self.reject_duplicate(key)),
                    IdempotencyProbe::Bypassed => idempotency_bypassed = true,
                    IdempotencyProbe::Absent => {}
                }
            }
        }

        let shared = self
            .open_context(&req.business_key, Some((lock, &mut idempotency_bypassed)))
            .await?;
        let tx_id = shared
            .lock()
            .expect("tx state poisoned")
            .ctx
            .tx_id()
            .to_string();

        if let Some(key) = req.idempotency_key.as_deref() {
            if !idempotency_bypassed {
                match self.idempotency.mark_processing(key).await {
                    Ok(()) => {}
                    Err(e) if e.is_unavailable() && self.config.degrade.on_kv_outage => {
                        warn!(tx_id, error = %e, "kv outage while marking processing, bypassing idempotency");
                        shared
                            .lock()
                            .expect("tx state poisoned")
                            .ctx
                            .add_risk(RiskFlag::IdempotencyBypassed);
                        idempotency_bypassed = true;
                    }
                    Err(e) => {
                        return Err(TxError::lock_unavailable(format!(
                            "kv store unreachable while marking processing: {e}"
                        ))
                        .into())
                    }
                }
            }
        }

        let handle = TxHandle {
            shared: Arc::clone(&shared),
            registry: Arc::clone(&self.registry),
        };

        // The business closure runs with the context bound to this task so
        // nested execute() calls join instead of re-entering the lifecycle.
        let business = CURRENT_TX.scope(Arc::clone(&shared), f(handle)).await;

        let idempotency = req
            .idempotency_key
            .as_deref()
            .filter(|_| !idempotency_bypassed);

        match business {
            Ok(value) => {
                self.finalize_commit(&tx_id, &shared, idempotency).await?;
                Ok(value)
            }
            Err(cause) => Err(self
                .finalize_rollback(&tx_id, &shared, idempotency, None, classify_business(cause))
                .await),
        }
    }

    /// Context + durable PENDING row. Shared by `execute` and `begin`.
    async fn open_context(
        &self,
        business_key: &str,
        locked: Option<(&LockHandle, &mut bool)>,
    ) -> Result<SharedTx, TxError> {
        let mut ctx = TxContext::new(business_key);
        ctx.transition_to(TxPhase::Collecting)?;

        if let Some((lock, idempotency_bypassed)) = locked {
            if lock.is_acquired() {
                ctx.add_lock(lock.key());
            }
            if lock.is_degraded() {
                warn!(
                    tx_id = ctx.tx_id(),
                    business_key, "proceeding without distributed lock (kv outage)"
                );
                ctx.add_risk(RiskFlag::LockBypassed);
            }
            if *idempotency_bypassed {
                ctx.add_risk(RiskFlag::IdempotencyBypassed);
            }
        }

        // The PENDING row is the recovery backbone; without it we refuse to
        // run the business logic at all.
        self.journal
            .open(ctx.tx_id(), business_key)
            .await
            .map_err(|e| {
                TxError::validation_failed(format!("journal store unavailable: {e}"))
            })?;

        info!(tx_id = ctx.tx_id(), business_key, "transaction opened");

        Ok(Arc::new(Mutex::new(TxState {
            ctx,
            payload: JournalPayload::new(),
            capture: CaptureBuffer::new(),
        })))
    }

    async fn finalize_commit(
        &self,
        tx_id: &str,
        shared: &SharedTx,
        idempotency_key: Option<&str>,
    ) -> Result<(), ExecuteError> {
        // Unconfirmed pre-events never succeeded locally; drop them.
        {
            let mut st = shared.lock().expect("tx state poisoned");
            let discarded = st.capture.discard_pending();
            if discarded > 0 {
                warn!(tx_id, discarded, "discarding unconfirmed capture pre-events");
            }
            if let Err(e) = st.ctx.transition_to(TxPhase::Validating) {
                return Err(ExecuteError::Tx(e));
            }
        }

        let (ctx_view, payload_view) = {
            let st = shared.lock().expect("tx state poisoned");
            (st.ctx.clone(), st.payload.clone())
        };
        let report = self.validator.validate(&ctx_view, &payload_view).await;

        // Fold the validator's findings back into the context so terminal
        // metrics see them.
        {
            let mut st = shared.lock().expect("tx state poisoned");
            for issue in &report.issues {
                match issue.check {
                    ValidationCheck::DbUnreachable => st.ctx.add_risk(RiskFlag::DbUnreachable),
                    ValidationCheck::LongRunningTx => st.ctx.add_risk(RiskFlag::LongRunningTx),
                    ValidationCheck::ResourceNotPrepared => {
                        st.ctx.add_risk(RiskFlag::ResourceNotPrepared)
                    }
                    ValidationCheck::MissingInverse | ValidationCheck::CriticalRisk => {}
                }
            }
        }

        if !report.can_proceed {
            let cause = TxError::validation_failed(format!(
                "pre-commit validation refused: {}",
                report.summary()
            ));
            return Err(self
                .finalize_rollback(tx_id, shared, idempotency_key, None, ExecuteError::Tx(cause))
                .await);
        }
        if !report.is_clean() {
            info!(tx_id, issues = %report.summary(), risk = ?report.overall_risk, "validation passed with warnings");
        }

        {
            let mut st = shared.lock().expect("tx state poisoned");
            if let Err(e) = st.ctx.transition_to(TxPhase::Prepared) {
                return Err(ExecuteError::Tx(e));
            }
        }

        // Durable flush of the collected journal before any commit.
        let payload_view = shared.lock().expect("tx state poisoned").payload.clone();
        if let Err(e) = self.journal.flush(tx_id, &payload_view).await {
            let cause =
                TxError::validation_failed(format!("journal flush before commit failed: {e}"));
            return Err(self
                .finalize_rollback(tx_id, shared, idempotency_key, None, ExecuteError::Tx(cause))
                .await);
        }

        {
            let mut st = shared.lock().expect("tx state poisoned");
            if let Err(e) = st.ctx.transition_to(TxPhase::Committing) {
                return Err(ExecuteError::Tx(e));
            }
        }

        // Participant commits, strictly in enlistment order.
        let enlisted: Vec<String> = {
            let st = shared.lock().expect("tx state poisoned");
            st.ctx.enlistments().iter().map(|e| e.name.clone()).collect()
        };

        let mut committed: HashSet<String> = HashSet::new();
        for name in &enlisted {
            let participant = match self.registry.get(name) {
                Some(p) => p,
                None => {
                    // Enlistment is checked against the registry, so this is
                    // a wiring bug, not a runtime condition.
                    let cause = TxError::invariant(format!(
                        "enlisted resource '{name}' vanished from the registry"
                    ));
                    return Err(self
                        .finalize_rollback(
                            tx_id,
                            shared,
                            idempotency_key,
                            Some(committed),
                            ExecuteError::Tx(cause),
                        )
                        .await);
                }
            };
            if let Err(e) = participant.commit().await {
                error!(tx_id, resource = %name, error = %e, "participant commit failed");
                let cause = TxError::participant_commit_failed(format!(
                    "commit of '{name}' failed: {e}"
                ));
                return Err(self
                    .finalize_rollback(
                        tx_id,
                        shared,
                        idempotency_key,
                        Some(committed),
                        ExecuteError::Tx(cause),
                    )
                    .await);
            }
            committed.insert(name.clone());
        }

        // All participants committed: the transaction is done regardless of
        // what bookkeeping below still fails.
        let (duration_ms, payload_view) = {
            let mut st = shared.lock().expect("tx state poisoned");
            if let Err(e) = st.ctx.transition_to(TxPhase::Committed) {
                return Err(ExecuteError::Tx(e));
            }
            (st.ctx.duration_ms(), st.payload.clone())
        };

        if let Err(e) = self
            .journal
            .close(tx_id, TxLogStatus::Committed, &payload_view)
            .await
        {
            error!(tx_id, error = %e, "journal COMMITTED write failed; recovery will re-inspect this row");
        }

        if let Some(key) = idempotency_key {
            if let Err(e) = self.idempotency.mark_completed(key).await {
                warn!(tx_id, error = %e, "idempotency completion marker failed");
                self.metrics.record_risk(RiskFlag::IdempotencyBypassed);
            }
        }

        self.metrics.record_committed(duration_ms);
        self.flush_risk_metrics(shared);
        info!(tx_id, duration_ms, "transaction committed");
        Ok(())
    }

    /// Rollback path: local rollback for uncommitted participants, inverse
    /// replay for committed ones, terminal status + idempotency cleanup.
    /// Returns the error the caller should see.
    async fn finalize_rollback(
        &self,
        tx_id: &str,
        shared: &SharedTx,
        idempotency_key: Option<&str>,
        committed: Option<HashSet<String>>,
        cause: ExecuteError,
    ) -> ExecuteError {
        let committed = committed.unwrap_or_default();

        // Participants whose local transaction is still open just roll it
        // back; their writes vanish with it.
        let enlisted: Vec<String> = {
            let st = shared.lock().expect("tx state poisoned");
            st.ctx.enlistments().iter().map(|e| e.name.clone()).collect()
        };
        for name in enlisted.iter().filter(|n| !committed.contains(*n)) {
            if let Some(p) = self.registry.get(name) {
                if let Err(e) = p.rollback().await {
                    warn!(tx_id, resource = %name, error = %e, "local rollback failed");
                }
            }
        }

        {
            let mut st = shared.lock().expect("tx state poisoned");
            st.capture.discard_pending();
            if let Err(e) = st.ctx.transition_to(TxPhase::RollingBack) {
                // Already past a terminal phase; a coordinator bug.
                error!(tx_id, error = %e, "rollback from unexpected phase");
                return ExecuteError::Tx(e);
            }
            st.payload.error = Some(cause.to_string());
        }

        let mut payload_view = shared.lock().expect("tx state poisoned").payload.clone();
        if let Err(e) = self
            .journal
            .close(tx_id, TxLogStatus::RollingBack, &payload_view)
            .await
        {
            warn!(tx_id, error = %e, "journal ROLLING_BACK write failed");
        }

        let outcome = self
            .compensator
            .compensate(tx_id, &mut payload_view, Some(&committed))
            .await;

        let final_status = if outcome.fully_compensated {
            TxLogStatus::RolledBack
        } else {
            TxLogStatus::Failed
        };

        let (duration_ms, payload_view) = {
            let mut st = shared.lock().expect("tx state poisoned");
            st.payload = payload_view;
            let next = if outcome.fully_compensated {
                TxPhase::RolledBack
            } else {
                TxPhase::Failed
            };
            if let Err(e) = st.ctx.transition_to(next) {
                error!(tx_id, error = %e, "terminal rollback transition refused");
            }
            (st.ctx.duration_ms(), st.payload.clone())
        };

        if let Err(e) = self.journal.close(tx_id, final_status, &payload_view).await {
            error!(tx_id, error = %e, status = final_status.as_str(), "journal terminal write failed");
        }

        // The business action failed before completion: delete the marker
        // so a well-formed retry can proceed.
        if let Some(key) = idempotency_key {
            if let Err(e) = self.idempotency.rollback(key).await {
                warn!(tx_id, error = %e, "idempotency rollback failed; marker will expire by ttl");
            }
        }

        self.flush_risk_metrics(shared);

        if outcome.fully_compensated {
            self.metrics.record_rolled_back(duration_ms);
            info!(tx_id, cause = %cause, "transaction rolled back");
            cause
        } else {
            self.metrics.record_failed(duration_ms);
            let remaining = payload_view.uncompensated();
            error!(
                tx_id,
                remaining, cause = %cause,
                "compensation incomplete; operator attention required"
            );
            ExecuteError::Tx(TxError::compensation_failed(format!(
                "{remaining} journal entr{} could not be compensated after: {cause}",
                if remaining == 1 { "y" } else { "ies" }
            )))
        }
    }

    fn flush_risk_metrics(&self, shared: &SharedTx) {
        let st = shared.lock().expect("tx state poisoned");
        for (flag, count) in st.ctx.risk().iter() {
            for _ in 0..count {
                self.metrics.record_risk(flag);
            }
        }
    }

    async fn check_duplicate(&self, key: &str) -> Result<IdempotencyProbe, TxError> {
        match self.idempotency.exists(key).await {
            Ok(true) => Ok(IdempotencyProbe::Duplicate),
            Ok(false) => Ok(IdempotencyProbe::Absent),
            Err(e) if e.is_unavailable() && self.config.degrade.on_kv_outage => {
                warn!(key, error = %e, "kv outage during idempotency check, bypassing");
                Ok(IdempotencyProbe::Bypassed)
            }
            Err(e) => Err(TxError::lock_unavailable(format!(
                "kv store unreachable during idempotency check: {e}"
            ))),
        }
    }

    fn reject_duplicate(&self, key: &str) -> ExecuteError {
        self.metrics.record_duplicate_rejected();
        ExecuteError::Tx(TxError::duplicate_request(format!(
            "idempotency key '{key}' already seen"
        )))
    }
}

enum IdempotencyProbe {
    Absent,
    Duplicate,
    Bypassed,
}

// ---------------------------------------------------------------------------
// TxHandle — the capture surface handed to business logic
// ---------------------------------------------------------------------------

/// Handle to the in-flight transaction, held by business logic and by
/// integration shims (ORM event adapters, bulk/native capture points).
#[derive(Clone)]
pub struct TxHandle {
    shared: SharedTx,
    registry: Arc<ParticipantRegistry>,
}

impl TxHandle {
    pub fn tx_id(&self) -> String {
        self.state().ctx.tx_id().to_string()
    }

    pub fn phase(&self) -> TxPhase {
        self.state().ctx.phase()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TxState> {
        self.shared.lock().expect("tx state poisoned")
    }

    /// Enlist a database (or queue) participant and open its local
    /// transaction. Idempotent per resource.
    ///
    /// # Errors
    /// `InvariantViolation` for resources absent from the registry;
    /// `ValidationFailed` when the participant cannot open its local
    /// transaction.
    pub async fn enlist_database(&self, name: &str) -> Result<(), TxError> {
        let participant = self.registry.get(name).ok_or_else(|| {
            TxError::invariant(format!("unknown resource '{name}' (not registered)"))
        })?;

        let newly_enlisted = {
            let mut st = self.state();
            let already = st.ctx.enlistment(name).is_some();
            st.ctx.enlist_resource(name, participant.kind());
            !already
        };

        if newly_enlisted {
            participant.begin().await.map_err(|e| {
                TxError::validation_failed(format!("begin on '{name}' failed: {e}"))
            })?;
        }
        Ok(())
    }

    /// Mark an enlisted resource as prepared for commit.
    pub fn mark_prepared(&self, name: &str) -> Result<(), TxError> {
        self.state().ctx.mark_prepared(name)
    }

    /// Record a single-entity operation with an optional before-image.
    pub fn record_entity_op(
        &self,
        datasource: &str,
        op: OperationKind,
        entity_class: &str,
        entity_id: Option<String>,
        before_image: Option<Value>,
    ) -> Result<(), TxError> {
        if !matches!(
            op,
            OperationKind::Insert | OperationKind::Update | OperationKind::Delete
        ) {
            return Err(TxError::invariant(format!(
                "record_entity_op cannot record {}; use the dedicated capture call",
                op.as_str()
            )));
        }
        let draft = DraftOperation {
            datasource: datasource.to_string(),
            op,
            entity_class: entity_class.to_string(),
            entity_id,
            before_image: before_image.as_ref().map(sakti_core::deep_copy),
            inverse: match op {
                OperationKind::Insert => None,
                _ => Some(sakti_core::InverseDescriptor::RestoreBeforeImage),
            },
        };
        self.append_draft(datasource, draft)
    }

    /// Record a bulk update/delete with captured row images and optionally
    /// an explicit inverse statement.
    pub fn record_bulk(
        &self,
        datasource: &str,
        op: OperationKind,
        entity_class: &str,
        affected_before_images: Vec<Value>,
        inverse_sql: Option<String>,
    ) -> Result<(), TxError> {
        if !op.is_bulk() {
            return Err(TxError::invariant(format!(
                "record_bulk cannot record {}",
                op.as_str()
            )));
        }
        let draft = DraftOperation::bulk(
            datasource,
            op,
            entity_class,
            affected_before_images,
            inverse_sql,
        );
        self.append_draft(datasource, draft)
    }

    /// Record a native statement with its inverse.
    #[allow(clippy::too_many_arguments)]
    pub fn record_native_query(
        &self,
        datasource: &str,
        entity_class: &str,
        entity_id: Option<String>,
        before_image: Option<Value>,
        inverse_sql: &str,
        params: Vec<Value>,
    ) -> Result<(), TxError> {
        let draft = DraftOperation::native_query(
            datasource,
            entity_class,
            entity_id,
            before_image,
            inverse_sql,
            params,
        );
        self.append_draft(datasource, draft)
    }

    /// Record a stored procedure call with its inverse call.
    pub fn record_stored_procedure(
        &self,
        datasource: &str,
        procedure: &str,
        inverse_procedure: &str,
        params: Vec<Value>,
        before_images: Vec<Value>,
    ) -> Result<(), TxError> {
        let draft = DraftOperation::stored_procedure(
            datasource,
            procedure,
            inverse_procedure,
            params,
            before_images,
        );
        self.append_draft(datasource, draft)
    }

    // ------------------------------------------------------------------
    // ORM-style pre/post hooks
    // ------------------------------------------------------------------

    pub fn on_pre_persist(&self, datasource: &str, entity: &dyn CapturedEntity) {
        self.state().capture.on_pre_persist(datasource, entity);
    }

    pub fn on_post_persist(
        &self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> Result<(), TxError> {
        let draft = self.state().capture.on_post_persist(datasource, entity);
        self.append_draft(datasource, draft)
    }

    pub fn on_pre_update(&self, datasource: &str, entity: &dyn CapturedEntity) {
        self.state().capture.on_pre_update(datasource, entity);
    }

    pub fn on_post_update(
        &self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> Result<(), TxError> {
        let draft = self.state().capture.on_post_update(datasource, entity);
        self.append_draft(datasource, draft)
    }

    pub fn on_pre_remove(&self, datasource: &str, entity: &dyn CapturedEntity) {
        self.state().capture.on_pre_remove(datasource, entity);
    }

    pub fn on_post_remove(
        &self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> Result<(), TxError> {
        let draft = self.state().capture.on_post_remove(datasource, entity);
        self.append_draft(datasource, draft)
    }

    // ------------------------------------------------------------------
    // Risk, metadata, propagation
    // ------------------------------------------------------------------

    pub fn add_risk(&self, flag: RiskFlag) {
        self.state().ctx.add_risk(flag);
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state().ctx.set_metadata(key, value);
    }

    /// Capture a propagation snapshot for an asynchronous continuation.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::capture(&self.state().ctx)
    }

    fn append_draft(&self, datasource: &str, draft: DraftOperation) -> Result<(), TxError> {
        let mut st = self.state();
        if st.ctx.enlistment(datasource).is_none() {
            return Err(TxError::invariant(format!(
                "operation on '{datasource}' recorded before enlistment"
            )));
        }
        let seq = st.ctx.next_sequence();
        st.payload.push(draft.into_entry(seq));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ManualTx — §external capture API (BeginTransaction / Commit / Rollback)
// ---------------------------------------------------------------------------

/// A transaction opened through [`Coordinator::begin`]. The integrator
/// drives the outcome explicitly; locks and idempotency are the
/// integrator's concern on this surface.
pub struct ManualTx<'a> {
    coordinator: &'a Coordinator,
    handle: TxHandle,
    tx_id: String,
}

impl ManualTx<'_> {
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    pub fn handle(&self) -> TxHandle {
        self.handle.clone()
    }

    /// Validate and commit. Consumes the transaction.
    pub async fn commit(self) -> Result<(), ExecuteError> {
        self.coordinator
            .finalize_commit(&self.tx_id, &self.handle.shared, None)
            .await
    }

    /// Roll back with a caller-supplied reason. Returns `Ok` when every
    /// captured operation was undone, `Err(COMPENSATION_FAILED)` otherwise.
    pub async fn rollback(self, reason: &str) -> Result<(), TxError> {
        let cause = ExecuteError::Business(anyhow::anyhow!("{reason}"));
        let out = self
            .coordinator
            .finalize_rollback(&self.tx_id, &self.handle.shared, None, None, cause)
            .await;
        match out {
            ExecuteError::Business(_) => Ok(()),
            ExecuteError::Tx(e) => Err(e),
        }
    }
}
