//! Risk flags carried on the transaction context.
//!
//! A flag is a categorical marker (long-running, degraded lock, …) counted
//! per transaction and surfaced to metrics. The aggregate level feeds the
//! pre-commit validator's CRITICAL_RISK check.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Conditions worth surfacing on a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    /// Transaction exceeded the long-running threshold.
    LongRunningTx,
    /// An enlisted resource never reported prepared.
    ResourceNotPrepared,
    /// An enlisted database failed its connectivity probe.
    DbUnreachable,
    /// KV outage: proceeding without a distributed lock.
    LockBypassed,
    /// KV outage: proceeding without idempotency protection.
    IdempotencyBypassed,
}

impl RiskFlag {
    pub const ALL: [RiskFlag; 5] = [
        RiskFlag::LongRunningTx,
        RiskFlag::ResourceNotPrepared,
        RiskFlag::DbUnreachable,
        RiskFlag::LockBypassed,
        RiskFlag::IdempotencyBypassed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::LongRunningTx => "LONG_RUNNING_TX",
            RiskFlag::ResourceNotPrepared => "RESOURCE_NOT_PREPARED",
            RiskFlag::DbUnreachable => "DB_UNREACHABLE",
            RiskFlag::LockBypassed => "LOCK_BYPASSED",
            RiskFlag::IdempotencyBypassed => "IDEMPOTENCY_BYPASSED",
        }
    }

    /// Intrinsic severity of one occurrence of this flag.
    pub fn level(&self) -> RiskLevel {
        match self {
            RiskFlag::LongRunningTx => RiskLevel::Medium,
            RiskFlag::ResourceNotPrepared => RiskLevel::Medium,
            RiskFlag::DbUnreachable => RiskLevel::Critical,
            RiskFlag::LockBypassed => RiskLevel::High,
            RiskFlag::IdempotencyBypassed => RiskLevel::High,
        }
    }
}

/// Ordered severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-transaction flag counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskMetrics {
    counts: BTreeMap<RiskFlag, u32>,
}

impl RiskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, flag: RiskFlag) {
        *self.counts.entry(flag).or_insert(0) += 1;
    }

    pub fn count(&self, flag: RiskFlag) -> u32 {
        self.counts.get(&flag).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RiskFlag, u32)> + '_ {
        self.counts.iter().map(|(f, c)| (*f, *c))
    }

    /// Aggregate severity: the maximum intrinsic level, escalated to
    /// `Critical` when two or more distinct `High` conditions coincide
    /// (e.g. both lock and idempotency bypassed).
    pub fn aggregate_level(&self) -> RiskLevel {
        let mut max = RiskLevel::Low;
        let mut high_flags = 0u32;
        for (flag, _) in self.iter() {
            let lvl = flag.level();
            if lvl >= RiskLevel::High {
                high_flags += 1;
            }
            if lvl > max {
                max = lvl;
            }
        }
        if max < RiskLevel::Critical && high_flags >= 2 {
            RiskLevel::Critical
        } else {
            max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_aggregate_low() {
        assert_eq!(RiskMetrics::new().aggregate_level(), RiskLevel::Low);
    }

    #[test]
    fn counts_accumulate_per_flag() {
        let mut r = RiskMetrics::new();
        r.add(RiskFlag::LongRunningTx);
        r.add(RiskFlag::LongRunningTx);
        assert_eq!(r.count(RiskFlag::LongRunningTx), 2);
        assert_eq!(r.count(RiskFlag::LockBypassed), 0);
    }

    #[test]
    fn aggregate_is_max_intrinsic_level() {
        let mut r = RiskMetrics::new();
        r.add(RiskFlag::LongRunningTx);
        assert_eq!(r.aggregate_level(), RiskLevel::Medium);
        r.add(RiskFlag::LockBypassed);
        assert_eq!(r.aggregate_level(), RiskLevel::High);
        r.add(RiskFlag::DbUnreachable);
        assert_eq!(r.aggregate_level(), RiskLevel::Critical);
    }

    #[test]
    fn two_distinct_high_flags_escalate_to_critical() {
        let mut r = RiskMetrics::new();
        r.add(RiskFlag::LockBypassed);
        r.add(RiskFlag::LockBypassed); // repeat of the same flag does not escalate
        assert_eq!(r.aggregate_level(), RiskLevel::High);
        r.add(RiskFlag::IdempotencyBypassed);
        assert_eq!(r.aggregate_level(), RiskLevel::Critical);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }
}
