//! Compensating executor.
//!
//! Replays inverses from the journal in descending sequence (reverse
//! insertion order). Each entry's compensation runs in its own local
//! transaction on the owning participant; a failure is recorded on the
//! entry and the next entry is still attempted: compensation is
//! best-effort per entry, and idempotent: a compensated entry is skipped
//! on re-run, so applying the executor twice converges to the same state.

use crate::participant::{plan_compensation, ParticipantRegistry};
use sakti_core::{JournalPayload, TxMetrics};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one compensation pass over a journal.
#[derive(Debug, Clone, Default)]
pub struct CompensationOutcome {
    /// Entries the pass tried to undo this run.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `true` when no entry in the journal remains uncompensated,
    /// including entries already compensated by earlier passes and entries
    /// outside this pass's datasource filter.
    pub fully_compensated: bool,
}

pub struct CompensatingExecutor {
    registry: Arc<ParticipantRegistry>,
    metrics: Arc<TxMetrics>,
}

impl CompensatingExecutor {
    pub fn new(registry: Arc<ParticipantRegistry>, metrics: Arc<TxMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Undo `payload`'s entries in reverse order.
    ///
    /// `only_datasources` limits the pass to entries whose local
    /// transaction actually committed (in-flight rollback). Entries outside
    /// the filter never took effect (their local transactions were rolled
    /// back), so they are marked compensated without touching the
    /// participant. Recovery passes `None`: after a crash the commit state
    /// is unknown and every inverse must be replayed (inverses are
    /// idempotent, so re-undoing a write that never happened is safe).
    pub async fn compensate(
        &self,
        tx_id: &str,
        payload: &mut JournalPayload,
        only_datasources: Option<&HashSet<String>>,
    ) -> CompensationOutcome {
        let mut outcome = CompensationOutcome::default();

        for i in (0..payload.entries.len()).rev() {
            if payload.entries[i].compensated {
                continue;
            }

            if let Some(filter) = only_datasources {
                if !filter.contains(&payload.entries[i].datasource) {
                    payload.entries[i].compensated = true;
                    payload.entries[i].compensation_error = None;
                    continue;
                }
            }

            outcome.attempted += 1;
            self.metrics.record_compensation_attempt();

            let result = self.apply_one(tx_id, payload, i).await;
            match result {
                Ok(()) => {
                    payload.entries[i].compensated = true;
                    payload.entries[i].compensation_error = None;
                    outcome.succeeded += 1;
                    self.metrics.record_compensation_success();
                }
                Err(msg) => {
                    warn!(
                        tx_id,
                        sequence = payload.entries[i].sequence,
                        error = %msg,
                        "compensation entry failed, continuing with remaining entries"
                    );
                    payload.entries[i].compensation_error = Some(msg);
                    outcome.failed += 1;
                    self.metrics.record_compensation_failure();
                }
            }
        }

        outcome.fully_compensated = payload.uncompensated() == 0;
        if outcome.attempted > 0 {
            info!(
                tx_id,
                attempted = outcome.attempted,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                complete = outcome.fully_compensated,
                "compensation pass finished"
            );
        }
        outcome
    }

    async fn apply_one(
        &self,
        tx_id: &str,
        payload: &JournalPayload,
        idx: usize,
    ) -> Result<(), String> {
        let entry = &payload.entries[idx];
        let participant = self
            .registry
            .get(&entry.datasource)
            .ok_or_else(|| format!("datasource '{}' is not registered", entry.datasource))?;
        let action = plan_compensation(entry).map_err(|e| e.to_string())?;
        participant
            .apply_inverse(&action)
            .await
            .map_err(|e| format!("{e} (tx {tx_id}, seq {})", entry.sequence))
    }
}
