//! Participant seam.
//!
//! A participant is one enlistable resource (a database, a message queue).
//! Implementations must be object-safe (`Arc<dyn Participant>`) and
//! `Send + Sync`; the coordinator calls them strictly sequentially within
//! one transaction, in enlistment order for commits and in reverse journal
//! order for compensation.

use async_trait::async_trait;
use sakti_core::{InverseDescriptor, OperationEntry, OperationKind, ResourceKind, TxError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failure reported by a participant operation.
#[derive(Debug, Clone)]
pub struct ParticipantError {
    pub message: String,
}

impl ParticipantError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParticipantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant error: {}", self.message)
    }
}

impl std::error::Error for ParticipantError {}

// ---------------------------------------------------------------------------
// Participant trait
// ---------------------------------------------------------------------------

/// One enlistable resource.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Stable resource identifier, used in enlistments and journal entries.
    fn name(&self) -> &str;

    fn kind(&self) -> ResourceKind;

    /// Open the local transaction (autocommit off). Called once, at
    /// enlistment.
    async fn begin(&self) -> Result<(), ParticipantError>;

    /// Commit the open local transaction.
    async fn commit(&self) -> Result<(), ParticipantError>;

    /// Roll back the open local transaction. Only undoes uncommitted work;
    /// committed effects need [`Participant::apply_inverse`].
    async fn rollback(&self) -> Result<(), ParticipantError>;

    /// Connectivity probe (`SELECT 1` or equivalent). Must be cheap; the
    /// validator soft-timeouts it.
    async fn probe(&self) -> Result<(), ParticipantError>;

    /// Apply one compensating action, wrapped in its own local
    /// transaction. Must be idempotent: re-applying an already-applied
    /// inverse is a no-op.
    async fn apply_inverse(&self, action: &InverseAction<'_>) -> Result<(), ParticipantError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable name → participant map, built during process init and shared
/// by the coordinator, validator and recovery worker.
#[derive(Default)]
pub struct ParticipantRegistry {
    inner: HashMap<String, Arc<dyn Participant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: Arc<dyn Participant>) {
        self.inner
            .insert(participant.name().to_string(), participant);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Participant>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Compensation planning
// ---------------------------------------------------------------------------

/// The concrete undo step for one journal entry.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseAction<'a> {
    /// Undo an INSERT: delete the row by entity id.
    DeleteById {
        entity_class: &'a str,
        entity_id: &'a str,
    },
    /// Undo an UPDATE/DELETE: overwrite the row with its before-image.
    RestoreImage {
        entity_class: &'a str,
        entity_id: Option<&'a str>,
        image: &'a Value,
    },
    /// Undo a bulk operation: replay captured before-images row-by-row.
    RestoreRows {
        entity_class: &'a str,
        rows: &'a [Value],
    },
    /// Execute an inverse SQL statement with bound parameters.
    ExecuteSql {
        sql: &'a str,
        params: &'a [Value],
    },
    /// Invoke an inverse stored procedure with bound parameters.
    CallProcedure {
        name: &'a str,
        params: &'a [Value],
    },
}

/// Select the compensation strategy for an entry.
///
/// | op | strategy |
/// |---|---|
/// | INSERT | delete by entity id |
/// | UPDATE / DELETE | overwrite with before-image (explicit SQL wins) |
/// | BULK_* | replay row images, or explicit inverse SQL |
/// | NATIVE_QUERY | inverse SQL with parameters |
/// | STORED_PROCEDURE | inverse procedure with parameters |
///
/// # Errors
/// `InvariantViolation` when the entry lacks the data its strategy needs;
/// the pre-commit validator is supposed to have refused such an entry.
pub fn plan_compensation(entry: &OperationEntry) -> Result<InverseAction<'_>, TxError> {
    match entry.op {
        OperationKind::Insert => {
            let id = entry.entity_id.as_deref().ok_or_else(|| {
                TxError::invariant(format!(
                    "journal seq {} is an INSERT without entity id",
                    entry.sequence
                ))
            })?;
            Ok(InverseAction::DeleteById {
                entity_class: &entry.entity_class,
                entity_id: id,
            })
        }
        OperationKind::Update | OperationKind::Delete => match (&entry.inverse, &entry.before_image)
        {
            (Some(InverseDescriptor::Sql { sql, params }), _) => Ok(InverseAction::ExecuteSql {
                sql,
                params,
            }),
            (_, Some(image)) => Ok(InverseAction::RestoreImage {
                entity_class: &entry.entity_class,
                entity_id: entry.entity_id.as_deref(),
                image,
            }),
            _ => Err(TxError::invariant(format!(
                "journal seq {} ({}) has neither before-image nor inverse",
                entry.sequence,
                entry.op.as_str()
            ))),
        },
        OperationKind::BulkUpdate | OperationKind::BulkDelete => match &entry.inverse {
            Some(InverseDescriptor::Sql { sql, params }) => Ok(InverseAction::ExecuteSql {
                sql,
                params,
            }),
            Some(InverseDescriptor::BulkRestore { rows }) => Ok(InverseAction::RestoreRows {
                entity_class: &entry.entity_class,
                rows,
            }),
            _ => Err(TxError::invariant(format!(
                "journal seq {} ({}) has no bulk inverse",
                entry.sequence,
                entry.op.as_str()
            ))),
        },
        OperationKind::NativeQuery => match &entry.inverse {
            Some(InverseDescriptor::Sql { sql, params }) => Ok(InverseAction::ExecuteSql {
                sql,
                params,
            }),
            _ => Err(TxError::invariant(format!(
                "journal seq {} (NATIVE_QUERY) has no inverse sql",
                entry.sequence
            ))),
        },
        OperationKind::StoredProcedure => match &entry.inverse {
            Some(InverseDescriptor::Procedure { name, params }) => {
                Ok(InverseAction::CallProcedure { name, params })
            }
            _ => Err(TxError::invariant(format!(
                "journal seq {} (STORED_PROCEDURE) has no inverse procedure",
                entry.sequence
            ))),
        },
    }
}
