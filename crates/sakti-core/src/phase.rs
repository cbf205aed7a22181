//! Transaction phase state machine.
//!
//! The transition graph is fixed:
//!
//! ```text
//! Created      → Collecting
//! Collecting   → Validating | RollingBack
//! Validating   → Prepared   | RollingBack
//! Prepared     → Committing | RollingBack
//! Committing   → Committed  | RollingBack
//! RollingBack  → RolledBack | Failed
//! ```
//!
//! `Committed`, `RolledBack` and `Failed` are terminal. Any attempt outside
//! the graph is an invariant violation; callers MUST treat it as a bug,
//! not as a recoverable condition.

use crate::error::TxError;
use serde::{Deserialize, Serialize};

/// All phases a transaction can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxPhase {
    Created,
    Collecting,
    Validating,
    Prepared,
    Committing,
    /// Every enlisted participant committed. **Terminal.**
    Committed,
    RollingBack,
    /// All captured effects were undone. **Terminal.**
    RolledBack,
    /// Compensation left uncompensated entries; operator attention
    /// required. **Terminal.**
    Failed,
}

impl TxPhase {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }

    /// Whether `self → next` is an edge of the phase graph.
    pub fn can_transition_to(&self, next: TxPhase) -> bool {
        use TxPhase::*;
        matches!(
            (self, next),
            (Created, Collecting)
                | (Collecting, Validating)
                | (Collecting, RollingBack)
                | (Validating, Prepared)
                | (Validating, RollingBack)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }

    /// Validate an edge, producing the invariant-violation error the
    /// coordinator propagates.
    pub fn check_transition(&self, next: TxPhase) -> Result<(), TxError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TxError::invariant(format!(
                "illegal phase transition: {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }

    /// Label form used in logs and the durable journal.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxPhase::Created => "CREATED",
            TxPhase::Collecting => "COLLECTING",
            TxPhase::Validating => "VALIDATING",
            TxPhase::Prepared => "PREPARED",
            TxPhase::Committing => "COMMITTING",
            TxPhase::Committed => "COMMITTED",
            TxPhase::RollingBack => "ROLLING_BACK",
            TxPhase::RolledBack => "ROLLED_BACK",
            TxPhase::Failed => "FAILED",
        }
    }
}
