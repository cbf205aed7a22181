//! Pre-commit validation.
//!
//! Runs after the business logic collected its operations and before any
//! participant commits. The validator holds the participant registry and
//! creates its probes per run and never stores live connection handles.
//!
//! Only DB_UNREACHABLE (and a journal entry that cannot be undone) is
//! fatal; everything else is a warning that travels as a risk flag.

use crate::participant::ParticipantRegistry;
use sakti_core::{JournalPayload, ResourceKind, RiskFlag, RiskLevel, TxContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Probe budget per enlisted database. A probe that cannot answer a
/// trivial read inside this window is treated as unreachable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationCheck {
    DbUnreachable,
    MissingInverse,
    LongRunningTx,
    ResourceNotPrepared,
    CriticalRisk,
}

impl ValidationCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCheck::DbUnreachable => "DB_UNREACHABLE",
            ValidationCheck::MissingInverse => "MISSING_INVERSE",
            ValidationCheck::LongRunningTx => "LONG_RUNNING_TX",
            ValidationCheck::ResourceNotPrepared => "RESOURCE_NOT_PREPARED",
            ValidationCheck::CriticalRisk => "CRITICAL_RISK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub check: ValidationCheck,
    pub severity: IssueSeverity,
    /// Resource or journal reference the issue is about, when applicable.
    pub subject: Option<String>,
    pub message: String,
}

/// Outcome of one validation run. `can_proceed` is false iff any issue is
/// an error; the coordinator refuses VALIDATING → PREPARED on false.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub can_proceed: bool,
    pub issues: Vec<ValidationIssue>,
    pub overall_risk: RiskLevel,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// One-line summary for logs and error messages.
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return "clean".to_string();
        }
        self.issues
            .iter()
            .map(|i| match &i.subject {
                Some(s) => format!("{}({})", i.check.as_str(), s),
                None => i.check.as_str().to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct PreCommitValidator {
    registry: Arc<ParticipantRegistry>,
    long_running_threshold: Duration,
}

impl PreCommitValidator {
    pub fn new(registry: Arc<ParticipantRegistry>, long_running_threshold: Duration) -> Self {
        Self {
            registry,
            long_running_threshold,
        }
    }

    /// Run every check against the context and collected journal.
    ///
    /// Probes run sequentially in enlistment order; issues come back in a
    /// deterministic order (errors first, then by check and subject).
    pub async fn validate(&self, ctx: &TxContext, payload: &JournalPayload) -> ValidationReport {
        let mut issues: Vec<ValidationIssue> = Vec::new();

        // 1. Connectivity: every enlisted database must answer a trivial
        //    read within the probe budget.
        for enlistment in ctx.enlistments() {
            if enlistment.kind != ResourceKind::Database {
                continue;
            }
            match self.registry.get(&enlistment.name) {
                Some(p) => {
                    let probe = tokio::time::timeout(PROBE_TIMEOUT, p.probe()).await;
                    let failure = match probe {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(_) => Some(format!("probe timed out after {PROBE_TIMEOUT:?}")),
                    };
                    if let Some(msg) = failure {
                        warn!(resource = %enlistment.name, %msg, "pre-commit probe failed");
                        issues.push(ValidationIssue {
                            check: ValidationCheck::DbUnreachable,
                            severity: IssueSeverity::Error,
                            subject: Some(enlistment.name.clone()),
                            message: msg,
                        });
                    }
                }
                None => issues.push(ValidationIssue {
                    check: ValidationCheck::DbUnreachable,
                    severity: IssueSeverity::Error,
                    subject: Some(enlistment.name.clone()),
                    message: "enlisted resource is not registered".to_string(),
                }),
            }
        }

        // 2. Every non-insert entry must be undoable at commit time.
        for entry in &payload.entries {
            if !entry.is_recoverable() {
                issues.push(ValidationIssue {
                    check: ValidationCheck::MissingInverse,
                    severity: IssueSeverity::Error,
                    subject: Some(format!("seq {}", entry.sequence)),
                    message: format!(
                        "{} on {} has neither before-image nor inverse descriptor",
                        entry.op.as_str(),
                        entry.entity_class
                    ),
                });
            }
        }

        // 3. Duration warning.
        let elapsed_ms = ctx.duration_ms();
        if elapsed_ms > self.long_running_threshold.as_millis() as i64 {
            issues.push(ValidationIssue {
                check: ValidationCheck::LongRunningTx,
                severity: IssueSeverity::Warning,
                subject: None,
                message: format!(
                    "transaction running for {elapsed_ms} ms (threshold {} ms)",
                    self.long_running_threshold.as_millis()
                ),
            });
        }

        // 4. Enlistments that never reported prepared.
        for enlistment in ctx.enlistments() {
            if !enlistment.prepared {
                issues.push(ValidationIssue {
                    check: ValidationCheck::ResourceNotPrepared,
                    severity: IssueSeverity::Warning,
                    subject: Some(enlistment.name.clone()),
                    message: "resource enlisted but not marked prepared".to_string(),
                });
            }
        }

        // 5. Aggregated context risk.
        if ctx.risk().aggregate_level() == RiskLevel::Critical {
            issues.push(ValidationIssue {
                check: ValidationCheck::CriticalRisk,
                severity: IssueSeverity::Warning,
                subject: None,
                message: "aggregated context risk is CRITICAL".to_string(),
            });
        }

        // Deterministic output: errors first, then check order, then subject.
        issues.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.check.cmp(&b.check))
                .then(a.subject.cmp(&b.subject))
        });

        let can_proceed = !issues.iter().any(|i| i.severity == IssueSeverity::Error);

        // Overall risk folds the issues into the context's accumulated flags.
        let mut risk = ctx.risk().clone();
        for issue in &issues {
            match issue.check {
                ValidationCheck::DbUnreachable => risk.add(RiskFlag::DbUnreachable),
                ValidationCheck::LongRunningTx => risk.add(RiskFlag::LongRunningTx),
                ValidationCheck::ResourceNotPrepared => risk.add(RiskFlag::ResourceNotPrepared),
                ValidationCheck::MissingInverse | ValidationCheck::CriticalRisk => {}
            }
        }

        ValidationReport {
            can_proceed,
            issues,
            overall_risk: risk.aggregate_level(),
        }
    }
}
