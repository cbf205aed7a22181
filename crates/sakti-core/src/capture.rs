//! Operation capture.
//!
//! Pre-events stash a pending snapshot keyed by entity identity; the
//! matching post-event promotes it into a confirmed draft with the resolved
//! entity id. A pre-event with no post-event before commit means the
//! operation never succeeded locally; the pending entry is discarded.
//!
//! The engine never reflects over entities. Integrators implement
//! [`CapturedEntity`]: a stable identity, a resolved id, and a canonical
//! before-image. Images are deep-copied on capture so later mutation of the
//! live entity cannot perturb the stored snapshot.

use crate::journal::{InverseDescriptor, OperationEntry, OperationKind};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Entity seam
// ---------------------------------------------------------------------------

/// Integrator-supplied view of a mutable entity.
pub trait CapturedEntity {
    /// Logical class name (e.g. `"Account"`).
    fn entity_class(&self) -> &str;

    /// Stable identity usable *before* the id is resolved (a natural key,
    /// an allocation placeholder, the object address, anything stable
    /// between the pre- and post-event of one operation).
    fn identity(&self) -> String;

    /// Resolved persistent id, once known. `None` before an insert flush.
    fn entity_id(&self) -> Option<String>;

    /// Canonical structured snapshot of current state.
    fn before_image(&self) -> Value;
}

/// Canonical deep copy: serialize to text and back, so the stored image
/// shares no structure with the live entity.
pub fn deep_copy(v: &Value) -> Value {
    let text = serde_json::to_string(v).expect("value serialization must not fail");
    serde_json::from_str(&text).expect("value round-trip must not fail")
}

// ---------------------------------------------------------------------------
// Draft operations
// ---------------------------------------------------------------------------

/// A confirmed operation awaiting its journal sequence.
#[derive(Debug, Clone)]
pub struct DraftOperation {
    pub datasource: String,
    pub op: OperationKind,
    pub entity_class: String,
    pub entity_id: Option<String>,
    pub before_image: Option<Value>,
    pub inverse: Option<InverseDescriptor>,
}

impl DraftOperation {
    /// Stamp the draft with its journal sequence.
    pub fn into_entry(self, sequence: u64) -> OperationEntry {
        OperationEntry {
            sequence,
            datasource: self.datasource,
            op: self.op,
            entity_class: self.entity_class,
            entity_id: self.entity_id,
            before_image: self.before_image,
            inverse: self.inverse,
            compensated: false,
            compensation_error: None,
        }
    }

    /// Manual capture of a bulk operation with its row-level before-images.
    pub fn bulk(
        datasource: impl Into<String>,
        op: OperationKind,
        entity_class: impl Into<String>,
        affected_before_images: Vec<Value>,
        inverse_sql: Option<String>,
    ) -> Self {
        let inverse = match inverse_sql {
            Some(sql) => Some(InverseDescriptor::Sql { sql, params: vec![] }),
            None => Some(InverseDescriptor::BulkRestore {
                rows: affected_before_images.iter().map(deep_copy).collect(),
            }),
        };
        Self {
            datasource: datasource.into(),
            op,
            entity_class: entity_class.into(),
            entity_id: None,
            before_image: None,
            inverse,
        }
    }

    /// Manual capture of a native query with an explicit inverse statement.
    #[allow(clippy::too_many_arguments)]
    pub fn native_query(
        datasource: impl Into<String>,
        entity_class: impl Into<String>,
        entity_id: Option<String>,
        before_image: Option<Value>,
        inverse_sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            datasource: datasource.into(),
            op: OperationKind::NativeQuery,
            entity_class: entity_class.into(),
            entity_id,
            before_image: before_image.as_ref().map(deep_copy),
            inverse: Some(InverseDescriptor::Sql {
                sql: inverse_sql.into(),
                params,
            }),
        }
    }

    /// Manual capture of a stored procedure call with its inverse call.
    pub fn stored_procedure(
        datasource: impl Into<String>,
        procedure: impl Into<String>,
        inverse_procedure: impl Into<String>,
        params: Vec<Value>,
        before_images: Vec<Value>,
    ) -> Self {
        let procedure = procedure.into();
        Self {
            datasource: datasource.into(),
            op: OperationKind::StoredProcedure,
            entity_class: procedure,
            entity_id: None,
            before_image: if before_images.is_empty() {
                None
            } else {
                Some(Value::Array(before_images.iter().map(deep_copy).collect()))
            },
            inverse: Some(InverseDescriptor::Procedure {
                name: inverse_procedure.into(),
                params,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Capture buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    datasource: String,
    entity_class: String,
    identity: String,
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: OperationKind,
    before_image: Option<Value>,
}

/// Pre/post event pairing for one transaction.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    pending: HashMap<PendingKey, PendingOp>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(datasource: &str, entity: &dyn CapturedEntity) -> PendingKey {
        PendingKey {
            datasource: datasource.to_string(),
            entity_class: entity.entity_class().to_string(),
            identity: entity.identity(),
        }
    }

    fn stash(&mut self, datasource: &str, entity: &dyn CapturedEntity, op: OperationKind) {
        let before_image = match op {
            // INSERT has no prior state to snapshot.
            OperationKind::Insert => None,
            _ => Some(deep_copy(&entity.before_image())),
        };
        self.pending
            .insert(Self::key(datasource, entity), PendingOp { op, before_image });
    }

    fn promote(
        &mut self,
        datasource: &str,
        entity: &dyn CapturedEntity,
        op: OperationKind,
    ) -> DraftOperation {
        let pending = self.pending.remove(&Self::key(datasource, entity));
        // A post-event without its pre-event can only carry what the entity
        // shows now; for inserts that is all we ever need.
        let before_image = pending.and_then(|p| p.before_image);
        DraftOperation {
            datasource: datasource.to_string(),
            op,
            entity_class: entity.entity_class().to_string(),
            entity_id: entity.entity_id(),
            before_image,
            inverse: match op {
                OperationKind::Insert => None,
                _ => Some(InverseDescriptor::RestoreBeforeImage),
            },
        }
    }

    pub fn on_pre_persist(&mut self, datasource: &str, entity: &dyn CapturedEntity) {
        self.stash(datasource, entity, OperationKind::Insert);
    }

    pub fn on_post_persist(
        &mut self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> DraftOperation {
        self.promote(datasource, entity, OperationKind::Insert)
    }

    pub fn on_pre_update(&mut self, datasource: &str, entity: &dyn CapturedEntity) {
        self.stash(datasource, entity, OperationKind::Update);
    }

    pub fn on_post_update(
        &mut self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> DraftOperation {
        self.promote(datasource, entity, OperationKind::Update)
    }

    pub fn on_pre_remove(&mut self, datasource: &str, entity: &dyn CapturedEntity) {
        self.stash(datasource, entity, OperationKind::Delete);
    }

    pub fn on_post_remove(
        &mut self,
        datasource: &str,
        entity: &dyn CapturedEntity,
    ) -> DraftOperation {
        self.promote(datasource, entity, OperationKind::Delete)
    }

    /// Number of stashed pre-events with no post-event yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop unconfirmed pre-events at commit time. Returns how many were
    /// discarded (operations that never succeeded locally).
    pub fn discard_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Account {
        /// Natural key, stable across the insert flush.
        number: String,
        id: Option<String>,
        balance: i64,
    }

    impl CapturedEntity for Account {
        fn entity_class(&self) -> &str {
            "Account"
        }

        fn identity(&self) -> String {
            self.number.clone()
        }

        fn entity_id(&self) -> Option<String> {
            self.id.clone()
        }

        fn before_image(&self) -> Value {
            json!({"id": self.id, "balance": self.balance})
        }
    }

    #[test]
    fn update_pre_post_carries_before_image() {
        let mut buf = CaptureBuffer::new();
        let mut acct = Account {
            number: "ACC-001".to_string(),
            id: Some("1".to_string()),
            balance: 100,
        };

        buf.on_pre_update("dbA", &acct);
        acct.balance = 250; // mutation after capture must not perturb the image
        let draft = buf.on_post_update("dbA", &acct);

        assert_eq!(draft.op, OperationKind::Update);
        assert_eq!(draft.entity_id.as_deref(), Some("1"));
        assert_eq!(draft.before_image.unwrap()["balance"], json!(100));
        assert_eq!(draft.inverse, Some(InverseDescriptor::RestoreBeforeImage));
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn insert_resolves_id_at_post_event() {
        let mut buf = CaptureBuffer::new();
        let mut acct = Account {
            number: "ACC-002".to_string(),
            id: None,
            balance: 0,
        };

        buf.on_pre_persist("dbA", &acct);
        assert_eq!(buf.pending_len(), 1);

        // The flush assigns the persistent id; the natural key kept the
        // pending entry addressable in between.
        acct.id = Some("41".to_string());
        let draft = buf.on_post_persist("dbA", &acct);
        assert_eq!(draft.op, OperationKind::Insert);
        assert_eq!(draft.entity_id.as_deref(), Some("41"));
        assert!(draft.before_image.is_none());
        assert!(draft.inverse.is_none());
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn orphan_pre_events_are_discarded() {
        let mut buf = CaptureBuffer::new();
        let acct = Account {
            number: "ACC-003".to_string(),
            id: Some("1".to_string()),
            balance: 7,
        };
        buf.on_pre_remove("dbA", &acct);
        assert_eq!(buf.pending_len(), 1);
        assert_eq!(buf.discard_pending(), 1);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn bulk_draft_without_sql_falls_back_to_row_restore() {
        let rows = vec![json!({"id": 1}), json!({"id": 2})];
        let draft = DraftOperation::bulk("dbA", OperationKind::BulkUpdate, "Account", rows, None);
        match draft.inverse {
            Some(InverseDescriptor::BulkRestore { rows }) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected inverse: {other:?}"),
        }
    }

    #[test]
    fn deep_copy_shares_no_structure() {
        let original = json!({"nested": {"a": [1, 2, 3]}});
        let copy = deep_copy(&original);
        assert_eq!(original, copy);
    }
}
