//! Context propagation across execution units.
//!
//! A snapshot is a serializable copy of the propagable subset of a context.
//! Restoring re-creates a context bound to the *current* execution unit,
//! referring to the same `tx_id` (the propagation root), so operations
//! recorded in the continuation land in the same journal. Resources are not
//! propagated by value: the continuation sees only what it re-enlists.

use crate::context::TxContext;
use crate::phase::TxPhase;
use crate::risk::RiskMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable capture of a context for asynchronous continuations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub tx_id: String,
    pub business_key: String,
    pub phase: TxPhase,
    pub started_at: DateTime<Utc>,
    pub risk: RiskMetrics,
    pub acquired_locks: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Journal sequence watermark at capture time; the continuation keeps
    /// numbering from here so per-transaction ordering stays total.
    pub sequence_watermark: u64,
    /// Capture instant.
    pub captured_at: DateTime<Utc>,
    /// Fingerprint of the capturing execution unit.
    pub origin: String,
}

impl ContextSnapshot {
    /// Capture the propagable subset of `ctx`.
    pub fn capture(ctx: &TxContext) -> Self {
        Self {
            tx_id: ctx.tx_id().to_string(),
            business_key: ctx.business_key().to_string(),
            phase: ctx.phase(),
            started_at: ctx.started_at(),
            risk: ctx.risk().clone(),
            acquired_locks: ctx.acquired_locks().to_vec(),
            metadata: ctx.metadata().clone(),
            sequence_watermark: ctx.sequence_watermark(),
            captured_at: Utc::now(),
            origin: origin_fingerprint(),
        }
    }

    /// Re-create a context bound to the current execution unit.
    /// Enlistments are intentionally absent; a continuation that intends to
    /// write must re-enlist its resources first.
    pub fn restore(&self) -> TxContext {
        TxContext::rebind(
            self.tx_id.clone(),
            self.business_key.clone(),
            self.phase,
            self.started_at,
            self.risk.clone(),
            self.acquired_locks.clone(),
            self.metadata.clone(),
            self.sequence_watermark,
        )
    }
}

fn origin_fingerprint() -> String {
    format!("pid-{}", std::process::id())
}
