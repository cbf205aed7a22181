//! In-process coordinator metrics.
//!
//! All updates are lock-free atomics; readers may observe slightly stale
//! derived values. Counters are cumulative for the process lifetime;
//! export/reset policy belongs to whatever scrapes them.

use crate::risk::RiskFlag;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter set. Wrap in an `Arc` and hand clones to the coordinator
/// and the recovery worker.
#[derive(Debug, Default)]
pub struct TxMetrics {
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    duplicates_rejected: AtomicU64,
    lock_unavailable: AtomicU64,

    compensation_attempts: AtomicU64,
    compensation_successes: AtomicU64,
    compensation_failures: AtomicU64,

    duration_ms_sum: AtomicU64,
    duration_ms_max: AtomicU64,

    risk_counts: [AtomicU64; RiskFlag::ALL.len()],
}

impl TxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_committed(&self, duration_ms: i64) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration_ms);
    }

    pub fn record_rolled_back(&self, duration_ms: i64) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration_ms);
    }

    pub fn record_failed(&self, duration_ms: i64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(duration_ms);
    }

    pub fn record_duplicate_rejected(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_unavailable(&self) {
        self.lock_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compensation_attempt(&self) {
        self.compensation_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compensation_success(&self) {
        self.compensation_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compensation_failure(&self) {
        self.compensation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_risk(&self, flag: RiskFlag) {
        self.risk_counts[flag_index(flag)].fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, duration_ms: i64) {
        let d = duration_ms.max(0) as u64;
        self.duration_ms_sum.fetch_add(d, Ordering::Relaxed);
        self.duration_ms_max.fetch_max(d, Ordering::Relaxed);
    }

    /// Point-in-time snapshot with derived rates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let committed = self.committed.load(Ordering::Relaxed);
        let rolled_back = self.rolled_back.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = committed + rolled_back + failed;

        let comp_attempts = self.compensation_attempts.load(Ordering::Relaxed);
        let comp_successes = self.compensation_successes.load(Ordering::Relaxed);

        let duration_sum = self.duration_ms_sum.load(Ordering::Relaxed);

        let mut risk = Vec::new();
        for flag in RiskFlag::ALL {
            let n = self.risk_counts[flag_index(flag)].load(Ordering::Relaxed);
            if n > 0 {
                risk.push((flag, n));
            }
        }

        MetricsSnapshot {
            started,
            committed,
            rolled_back,
            failed,
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            lock_unavailable: self.lock_unavailable.load(Ordering::Relaxed),
            compensation_attempts: comp_attempts,
            compensation_successes: comp_successes,
            compensation_failures: self.compensation_failures.load(Ordering::Relaxed),
            duration_ms_sum: duration_sum,
            duration_ms_max: self.duration_ms_max.load(Ordering::Relaxed),
            success_rate: ratio(committed, finished),
            compensation_success_rate: ratio(comp_successes, comp_attempts),
            avg_duration_ms: if finished == 0 {
                0.0
            } else {
                duration_sum as f64 / finished as f64
            },
            risk_flag_counts: risk,
        }
    }
}

fn flag_index(flag: RiskFlag) -> usize {
    RiskFlag::ALL
        .iter()
        .position(|f| *f == flag)
        .expect("flag present in ALL")
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Derived view of [`TxMetrics`] at one instant.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub duplicates_rejected: u64,
    pub lock_unavailable: u64,
    pub compensation_attempts: u64,
    pub compensation_successes: u64,
    pub compensation_failures: u64,
    pub duration_ms_sum: u64,
    pub duration_ms_max: u64,
    pub success_rate: f64,
    pub compensation_success_rate: f64,
    pub avg_duration_ms: f64,
    pub risk_flag_counts: Vec<(RiskFlag, u64)>,
}
