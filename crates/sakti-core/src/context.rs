//! Per-transaction in-memory context.
//!
//! Single-writer: a context is owned by the execution unit that created it
//! and is mutated only by the phase coordinator and operation capture.
//! Other units see it only through an explicit snapshot
//! (`ContextSnapshot::capture` / `restore`).

use crate::error::TxError;
use crate::phase::TxPhase;
use crate::risk::{RiskFlag, RiskMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Participant resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Database,
    Queue,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "DATABASE",
            ResourceKind::Queue => "QUEUE",
        }
    }
}

/// One participant registered with the transaction. Enlistments are
/// append-only within a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEnlistment {
    pub name: String,
    pub kind: ResourceKind,
    pub prepared: bool,
    /// Join order; participant commits run in this order.
    pub sequence: u32,
}

/// In-memory state of the currently-executing transaction.
#[derive(Debug, Clone)]
pub struct TxContext {
    tx_id: String,
    business_key: String,
    phase: TxPhase,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    enlistments: Vec<ResourceEnlistment>,
    risk: RiskMetrics,
    acquired_locks: Vec<String>,
    metadata: BTreeMap<String, String>,
    next_sequence: u64,
}

impl TxContext {
    /// Open a fresh context in phase `Created`.
    pub fn new(business_key: impl Into<String>) -> Self {
        Self {
            tx_id: Uuid::new_v4().to_string(),
            business_key: business_key.into(),
            phase: TxPhase::Created,
            started_at: Utc::now(),
            completed_at: None,
            enlistments: Vec::new(),
            risk: RiskMetrics::new(),
            acquired_locks: Vec::new(),
            metadata: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Rebind a context from propagated state. Enlistments are NOT carried
    /// over; a continuation must re-enlist before writing.
    pub(crate) fn rebind(
        tx_id: String,
        business_key: String,
        phase: TxPhase,
        started_at: DateTime<Utc>,
        risk: RiskMetrics,
        acquired_locks: Vec<String>,
        metadata: BTreeMap<String, String>,
        next_sequence: u64,
    ) -> Self {
        Self {
            tx_id,
            business_key,
            phase,
            started_at,
            completed_at: None,
            enlistments: Vec::new(),
            risk,
            acquired_locks,
            metadata,
            next_sequence,
        }
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    pub fn business_key(&self) -> &str {
        &self.business_key
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock duration; falls back to "so far" while the transaction is
    /// still live.
    pub fn duration_ms(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }

    // ------------------------------------------------------------------
    // Enlistment
    // ------------------------------------------------------------------

    /// Register a participant. Idempotent per name: re-enlisting returns
    /// the original join sequence.
    pub fn enlist_resource(&mut self, name: &str, kind: ResourceKind) -> u32 {
        if let Some(existing) = self.enlistments.iter().find(|e| e.name == name) {
            return existing.sequence;
        }
        let sequence = self.enlistments.len() as u32;
        self.enlistments.push(ResourceEnlistment {
            name: name.to_string(),
            kind,
            prepared: false,
            sequence,
        });
        sequence
    }

    /// Mark an enlisted resource prepared.
    ///
    /// # Errors
    /// `InvariantViolation` when `name` was never enlisted.
    pub fn mark_prepared(&mut self, name: &str) -> Result<(), TxError> {
        match self.enlistments.iter_mut().find(|e| e.name == name) {
            Some(e) => {
                e.prepared = true;
                Ok(())
            }
            None => Err(TxError::invariant(format!(
                "mark_prepared on unknown resource '{name}'"
            ))),
        }
    }

    pub fn enlistments(&self) -> &[ResourceEnlistment] {
        &self.enlistments
    }

    pub fn enlistment(&self, name: &str) -> Option<&ResourceEnlistment> {
        self.enlistments.iter().find(|e| e.name == name)
    }

    // ------------------------------------------------------------------
    // Phase transitions
    // ------------------------------------------------------------------

    /// Drive the phase machine one edge. Terminal transitions stamp the
    /// completion time used for duration metrics.
    pub fn transition_to(&mut self, next: TxPhase) -> Result<(), TxError> {
        self.phase.check_transition(next)?;
        self.phase = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Journal sequencing
    // ------------------------------------------------------------------

    /// Next monotonic journal sequence for this transaction.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub(crate) fn sequence_watermark(&self) -> u64 {
        self.next_sequence
    }

    // ------------------------------------------------------------------
    // Risk, locks, metadata
    // ------------------------------------------------------------------

    pub fn add_risk(&mut self, flag: RiskFlag) {
        self.risk.add(flag);
    }

    pub fn risk(&self) -> &RiskMetrics {
        &self.risk
    }

    pub fn add_lock(&mut self, key: impl Into<String>) {
        self.acquired_locks.push(key.into());
    }

    pub fn acquired_locks(&self) -> &[String] {
        &self.acquired_locks
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
