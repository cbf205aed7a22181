//! Transaction lifecycle core: phases, context, journal model, risk flags,
//! context propagation, operation capture and in-process metrics.
//!
//! This crate is pure state: no IO, no async. The engine crate drives
//! these types; the KV and DB crates persist them.

mod capture;
mod context;
mod error;
mod journal;
mod metrics;
mod phase;
mod propagation;
mod risk;

pub use capture::{deep_copy, CaptureBuffer, CapturedEntity, DraftOperation};
pub use context::{ResourceEnlistment, ResourceKind, TxContext};
pub use error::{TxError, TxErrorKind};
pub use journal::{
    InverseDescriptor, JournalPayload, OperationEntry, OperationKind, TxLogStatus,
};
pub use metrics::{MetricsSnapshot, TxMetrics};
pub use phase::TxPhase;
pub use propagation::ContextSnapshot;
pub use risk::{RiskFlag, RiskLevel, RiskMetrics};
