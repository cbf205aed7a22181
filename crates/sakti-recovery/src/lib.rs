//! Background recovery worker.
//!
//! Periodically scans the durable journal for transactions that went quiet
//! without reaching a terminal status (a coordinator that crashed
//! mid-commit or mid-rollback leaves a PENDING / ROLLING_BACK row behind)
//! and drives each one to ROLLED_BACK (compensation succeeded) or FAILED
//! (retry budget exhausted; operator attention).
//!
//! Concurrency: at most one scan in flight per process (overlapping ticks
//! are skipped), and a per-row advisory lock `recovery:tx:<tx_id>` keeps
//! two nodes off the same row. Compensation itself is idempotent per
//! entry, so the advisory lock is about wasted work, not correctness.

use sakti_config::RecoveryConfig;
use sakti_core::{TxLogStatus, TxMetrics};
use sakti_engine::{CompensatingExecutor, ParticipantRegistry, TxLogRow, TxLogStore};
use sakti_kv::{KvClient, LockManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound of rows touched per scan; anything beyond waits for the
/// next tick.
const SCAN_BATCH_LIMIT: i64 = 50;

/// Advisory lease per row. Long enough for a worst-case compensation run,
/// short enough that a crashed worker frees the row within one interval.
const ROW_LOCK_LEASE: Duration = Duration::from_secs(60);

/// Per-scan summary, logged and folded into metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows the scan considered.
    pub scanned: usize,
    /// Rows driven to ROLLED_BACK.
    pub recovered: usize,
    /// Rows driven to FAILED (retry budget exhausted).
    pub failed: usize,
    /// Rows skipped: another node holds the advisory lock, or compensation
    /// made partial progress and the row waits for the next scan.
    pub skipped: usize,
}

pub struct RecoveryWorker {
    config: RecoveryConfig,
    store: Arc<dyn TxLogStore>,
    compensator: CompensatingExecutor,
    locks: LockManager,
    metrics: Arc<TxMetrics>,
    scanning: AtomicBool,
}

impl RecoveryWorker {
    pub fn new(
        config: RecoveryConfig,
        registry: Arc<ParticipantRegistry>,
        store: Arc<dyn TxLogStore>,
        kv: Arc<dyn KvClient>,
        lock_prefix: impl Into<String>,
        degrade_on_kv_outage: bool,
        metrics: Arc<TxMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            compensator: CompensatingExecutor::new(registry, Arc::clone(&metrics)),
            locks: LockManager::new(kv, lock_prefix, degrade_on_kv_outage),
            metrics,
            scanning: AtomicBool::new(false),
        }
    }

    /// One full scan. Safe to call from multiple places; a scan that finds
    /// another in flight returns an empty report immediately.
    pub async fn scan_once(&self) -> anyhow::Result<RecoveryReport> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(RecoveryReport::default());
        }
        let result = self.scan_inner().await;
        self.scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn scan_inner(&self) -> anyhow::Result<RecoveryReport> {
        let stalled = self
            .store
            .list_stalled(self.config.stall_threshold(), SCAN_BATCH_LIMIT)
            .await?;

        let mut report = RecoveryReport {
            scanned: stalled.len(),
            ..Default::default()
        };

        for row in stalled {
            match self.recover_row(row).await {
                RowOutcome::Recovered => report.recovered += 1,
                RowOutcome::Failed => report.failed += 1,
                RowOutcome::Skipped => report.skipped += 1,
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                recovered = report.recovered,
                failed = report.failed,
                skipped = report.skipped,
                "recovery scan finished"
            );
        }
        Ok(report)
    }

    async fn recover_row(&self, mut row: TxLogRow) -> RowOutcome {
        let tx_id = row.tx_id.clone();

        // Keep other nodes off this row. Wait zero: a contended row is
        // simply someone else's work.
        let lock_key = format!("recovery:tx:{tx_id}");
        let lock = match self
            .locks
            .try_lock(&lock_key, Duration::ZERO, ROW_LOCK_LEASE)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(tx_id, error = %e, "advisory lock unavailable, skipping row");
                return RowOutcome::Skipped;
            }
        };
        if !lock.is_acquired() && !lock.is_degraded() {
            return RowOutcome::Skipped;
        }
        // Degraded handle: proceed anyway. Per-entry compensation is
        // idempotent, so the worst case of two nodes overlapping is
        // duplicated no-op work.

        let outcome = self.recover_locked(&mut row).await;
        lock.release().await;
        outcome
    }

    async fn recover_locked(&self, row: &mut TxLogRow) -> RowOutcome {
        let tx_id = row.tx_id.clone();

        if row.retry_count >= self.config.max_retries as i32 {
            return self.give_up(row).await;
        }

        let retry = match self.store.bump_retry(&tx_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(tx_id, error = %e, "retry bump failed, skipping row");
                return RowOutcome::Skipped;
            }
        };
        info!(
            tx_id,
            retry,
            status = row.status.as_str(),
            "recovering stalled transaction"
        );

        // Post-crash commit state is unknown, so every inverse is replayed
        // (no datasource filter); inverses are idempotent by entry.
        let outcome = self
            .compensator
            .compensate(&tx_id, &mut row.payload, None)
            .await;

        if outcome.fully_compensated {
            if let Err(e) = self
                .store
                .mark_status(&tx_id, TxLogStatus::RolledBack, Some(&row.payload))
                .await
            {
                error!(tx_id, error = %e, "ROLLED_BACK write failed; row will be rescanned");
                return RowOutcome::Skipped;
            }
            self.metrics
                .record_rolled_back((chrono::Utc::now() - row.created_at).num_milliseconds());
            info!(tx_id, "stalled transaction rolled back");
            return RowOutcome::Recovered;
        }

        // Partial progress: persist per-entry compensation state so the
        // next attempt only retries what is still outstanding.
        if let Err(e) = self.store.record_payload(&tx_id, &row.payload).await {
            warn!(tx_id, error = %e, "partial compensation state not persisted");
        }

        if retry >= self.config.max_retries as i32 {
            row.retry_count = retry;
            return self.give_up(row).await;
        }

        warn!(
            tx_id,
            retry,
            remaining = row.payload.uncompensated(),
            "compensation incomplete, leaving row for next scan"
        );
        RowOutcome::Skipped
    }

    async fn give_up(&self, row: &TxLogRow) -> RowOutcome {
        let tx_id = &row.tx_id;
        if let Err(e) = self
            .store
            .mark_status(tx_id, TxLogStatus::Failed, Some(&row.payload))
            .await
        {
            error!(tx_id, error = %e, "FAILED write failed; row will be rescanned");
            return RowOutcome::Skipped;
        }
        self.metrics
            .record_failed((chrono::Utc::now() - row.created_at).num_milliseconds());
        error!(
            tx_id,
            retries = row.retry_count,
            remaining = row.payload.uncompensated(),
            "retry budget exhausted; operator attention required"
        );
        RowOutcome::Failed
    }
}

enum RowOutcome {
    Recovered,
    Failed,
    Skipped,
}

/// Run the worker until `shutdown` flips to `true` (or its sender drops).
/// The first scan happens immediately, so a restarting node reconciles
/// whatever the previous process left behind before settling into the
/// interval.
pub fn spawn(worker: Arc<RecoveryWorker>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(worker.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_ms = worker.config.interval_ms,
            stall_threshold_ms = worker.config.stall_threshold_ms,
            "recovery worker started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = worker.scan_once().await {
                        warn!(error = %e, "recovery scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recovery worker stopped");
    })
}
