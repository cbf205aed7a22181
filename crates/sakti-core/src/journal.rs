//! Operation journal model.
//!
//! One [`OperationEntry`] per captured write, ordered by a monotonic
//! per-transaction sequence. Entries are immutable once written; only the
//! compensation bookkeeping fields flip, and only the compensating executor
//! flips them. The serialized [`JournalPayload`] (entries + error message)
//! is what lands in the durable `tx_log.payload` column and the KV hot
//! mirror.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// Captured operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
    NativeQuery,
    StoredProcedure,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::BulkUpdate => "BULK_UPDATE",
            OperationKind::BulkDelete => "BULK_DELETE",
            OperationKind::NativeQuery => "NATIVE_QUERY",
            OperationKind::StoredProcedure => "STORED_PROCEDURE",
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, OperationKind::BulkUpdate | OperationKind::BulkDelete)
    }
}

// ---------------------------------------------------------------------------
// Inverse descriptors
// ---------------------------------------------------------------------------

/// How to undo an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum InverseDescriptor {
    /// Overwrite the row with the entry's before-image.
    RestoreBeforeImage,
    /// Replay captured before-images row-by-row (bulk operations).
    BulkRestore { rows: Vec<Value> },
    /// Execute inverse SQL with bound parameters.
    Sql { sql: String, params: Vec<Value> },
    /// Invoke an inverse stored procedure with bound parameters.
    Procedure { name: String, params: Vec<Value> },
}

// ---------------------------------------------------------------------------
// Journal entry
// ---------------------------------------------------------------------------

/// One captured operation with everything needed to undo it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEntry {
    /// Monotonic per-transaction sequence (1-based).
    pub sequence: u64,
    /// Enlisted datasource this operation ran against.
    pub datasource: String,
    pub op: OperationKind,
    pub entity_class: String,
    /// Resolved entity id. `None` only for operations without row identity
    /// (bulk, native, procedures).
    pub entity_id: Option<String>,
    /// Snapshot taken before the mutation; `None` for INSERT.
    pub before_image: Option<Value>,
    /// Explicit undo recipe; derived from `before_image` when absent.
    pub inverse: Option<InverseDescriptor>,
    /// Set by the compensating executor once the inverse applied.
    #[serde(default)]
    pub compensated: bool,
    /// Last compensation failure for this entry, if any.
    #[serde(default)]
    pub compensation_error: Option<String>,
}

impl OperationEntry {
    /// Whether this entry carries enough information to be undone.
    ///
    /// INSERTs are always recoverable (delete by id). Everything else needs
    /// a before-image or an inverse descriptor; the pre-commit validator
    /// refuses PREPARED when a non-insert entry against a recoverable
    /// resource has neither.
    pub fn is_recoverable(&self) -> bool {
        match self.op {
            OperationKind::Insert => true,
            _ => self.before_image.is_some() || self.inverse.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized journal payload
// ---------------------------------------------------------------------------

/// The serialized journal: entries plus the originating error message for
/// failed/rolled-back transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalPayload {
    pub entries: Vec<OperationEntry>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JournalPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, enforcing per-transaction sequence monotonicity.
    /// A non-increasing sequence is a capture bug, not caller input: it
    /// panics in debug builds and is dropped in release builds.
    pub fn push(&mut self, entry: OperationEntry) {
        if let Some(last) = self.entries.last() {
            debug_assert!(
                entry.sequence > last.sequence,
                "journal sequence regression: {} after {}",
                entry.sequence,
                last.sequence
            );
            if entry.sequence <= last.sequence {
                return;
            }
        }
        self.entries.push(entry);
    }

    /// Entries in reverse insertion order, the compensation order.
    pub fn entries_descending(&self) -> impl Iterator<Item = &OperationEntry> {
        self.entries.iter().rev()
    }

    pub fn uncompensated(&self) -> usize {
        self.entries.iter().filter(|e| !e.compensated).count()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("journal payload serialization must not fail")
    }

    pub fn from_value(v: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v.clone())
    }
}

// ---------------------------------------------------------------------------
// Durable status
// ---------------------------------------------------------------------------

/// Status column of the durable `tx_log` row. PENDING covers every
/// non-terminal phase; rows idle in PENDING past the stall threshold are
/// recovery-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxLogStatus {
    Pending,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TxLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxLogStatus::Pending => "PENDING",
            TxLogStatus::Committed => "COMMITTED",
            TxLogStatus::RollingBack => "ROLLING_BACK",
            TxLogStatus::RolledBack => "ROLLED_BACK",
            TxLogStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TxLogStatus::Pending),
            "COMMITTED" => Some(TxLogStatus::Committed),
            "ROLLING_BACK" => Some(TxLogStatus::RollingBack),
            "ROLLED_BACK" => Some(TxLogStatus::RolledBack),
            "FAILED" => Some(TxLogStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxLogStatus::Committed | TxLogStatus::RolledBack | TxLogStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: u64, op: OperationKind) -> OperationEntry {
        OperationEntry {
            sequence: seq,
            datasource: "dbA".to_string(),
            op,
            entity_class: "Account".to_string(),
            entity_id: Some("1".to_string()),
            before_image: None,
            inverse: None,
            compensated: false,
            compensation_error: None,
        }
    }

    #[test]
    fn insert_is_recoverable_without_before_image() {
        assert!(entry(1, OperationKind::Insert).is_recoverable());
    }

    #[test]
    fn update_needs_before_image_or_inverse() {
        let mut e = entry(1, OperationKind::Update);
        assert!(!e.is_recoverable());
        e.before_image = Some(json!({"balance": 100}));
        assert!(e.is_recoverable());

        let mut e = entry(2, OperationKind::NativeQuery);
        assert!(!e.is_recoverable());
        e.inverse = Some(InverseDescriptor::Sql {
            sql: "update accounts set balance = $1 where id = $2".to_string(),
            params: vec![json!(100), json!(2)],
        });
        assert!(e.is_recoverable());
    }

    #[test]
    fn payload_preserves_order_and_iterates_descending() {
        let mut p = JournalPayload::new();
        p.push(entry(1, OperationKind::Insert));
        p.push(entry(2, OperationKind::Update));
        p.push(entry(3, OperationKind::Delete));

        let desc: Vec<u64> = p.entries_descending().map(|e| e.sequence).collect();
        assert_eq!(desc, vec![3, 2, 1]);
    }

    #[test]
    fn payload_roundtrips_through_value() {
        let mut p = JournalPayload::new();
        let mut e = entry(1, OperationKind::Update);
        e.before_image = Some(json!({"balance": 100}));
        e.inverse = Some(InverseDescriptor::RestoreBeforeImage);
        p.push(e);
        p.error = Some("dbB commit refused".to_string());

        let v = p.to_value();
        let back = JournalPayload::from_value(&v).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].sequence, 1);
        assert_eq!(back.error.as_deref(), Some("dbB commit refused"));
        assert_eq!(
            back.entries[0].inverse,
            Some(InverseDescriptor::RestoreBeforeImage)
        );
    }

    #[test]
    fn status_labels_roundtrip() {
        for s in [
            TxLogStatus::Pending,
            TxLogStatus::Committed,
            TxLogStatus::RollingBack,
            TxLogStatus::RolledBack,
            TxLogStatus::Failed,
        ] {
            assert_eq!(TxLogStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TxLogStatus::parse("BOGUS"), None);
        assert!(TxLogStatus::Failed.is_terminal());
        assert!(!TxLogStatus::Pending.is_terminal());
    }

    #[test]
    fn uncompensated_counts_pending_entries() {
        let mut p = JournalPayload::new();
        p.push(entry(1, OperationKind::Insert));
        let mut e2 = entry(2, OperationKind::Insert);
        e2.compensated = true;
        p.push(e2);
        assert_eq!(p.uncompensated(), 1);
    }
}
