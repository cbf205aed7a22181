//! Coordinator error taxonomy.
//!
//! Lifecycle failures are tagged values, not exceptions: the phase
//! coordinator switches on [`TxErrorKind`] and callers receive exactly one
//! kind plus a message. A `Committed` outcome is never reported alongside
//! one of these.

use std::fmt;

/// Error kinds visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxErrorKind {
    /// Idempotency hit; non-retryable with the same key.
    DuplicateRequest,
    /// Lock could not be acquired within the wait budget; retryable.
    LockUnavailable,
    /// Pre-commit validation refused the transaction; retryable after
    /// remediation.
    ValidationFailed,
    /// A participant commit failed; compensation was triggered.
    ParticipantCommitFailed,
    /// At least one inverse did not apply; operator action required.
    CompensationFailed,
    /// KV outage caused a lock/idempotency bypass. Raised as a risk flag in
    /// normal operation; only surfaces as an error where a bypass is not
    /// permitted.
    DegradedMode,
    /// Illegal phase transition, missing enlistment, unknown resource.
    /// Fatal and indicative of a bug.
    InvariantViolation,
}

impl TxErrorKind {
    /// Wire/label form, matching the journal and log vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxErrorKind::DuplicateRequest => "DUPLICATE_REQUEST",
            TxErrorKind::LockUnavailable => "LOCK_UNAVAILABLE",
            TxErrorKind::ValidationFailed => "VALIDATION_FAILED",
            TxErrorKind::ParticipantCommitFailed => "PARTICIPANT_COMMIT_FAILED",
            TxErrorKind::CompensationFailed => "COMPENSATION_FAILED",
            TxErrorKind::DegradedMode => "DEGRADED_MODE",
            TxErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }

    /// Whether a caller may retry the same request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxErrorKind::LockUnavailable | TxErrorKind::ValidationFailed
        )
    }
}

/// A tagged lifecycle failure.
#[derive(Debug, Clone)]
pub struct TxError {
    kind: TxErrorKind,
    message: String,
}

impl TxError {
    pub fn new(kind: TxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn duplicate_request(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::DuplicateRequest, message)
    }

    pub fn lock_unavailable(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::LockUnavailable, message)
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::ValidationFailed, message)
    }

    pub fn participant_commit_failed(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::ParticipantCommitFailed, message)
    }

    pub fn compensation_failed(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::CompensationFailed, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::InvariantViolation, message)
    }

    pub fn kind(&self) -> TxErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for TxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_label_and_message() {
        let e = TxError::duplicate_request("key op-7 already completed");
        assert_eq!(e.to_string(), "DUPLICATE_REQUEST: key op-7 already completed");
        assert_eq!(e.kind(), TxErrorKind::DuplicateRequest);
    }

    #[test]
    fn retryability_per_kind() {
        assert!(TxErrorKind::LockUnavailable.is_retryable());
        assert!(TxErrorKind::ValidationFailed.is_retryable());
        assert!(!TxErrorKind::DuplicateRequest.is_retryable());
        assert!(!TxErrorKind::ParticipantCommitFailed.is_retryable());
        assert!(!TxErrorKind::CompensationFailed.is_retryable());
        assert!(!TxErrorKind::InvariantViolation.is_retryable());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(TxErrorKind::CompensationFailed.as_str(), "COMPENSATION_FAILED");
        assert_eq!(TxErrorKind::InvariantViolation.as_str(), "INVARIANT_VIOLATION");
    }
}
