//! Postgres participant.
//!
//! Holds at most one open `sqlx::Transaction` per enlistment: the local
//! transaction the coordinator commits or rolls back. Compensating inverses
//! run *outside* that transaction, each wrapped in its own short
//! transaction, because they undo effects that already committed.
//!
//! Entity-level compensation needs to know which table a logical entity
//! class lives in; the integrator supplies that once per participant as
//! [`TableBinding`]s. Restore semantics are delete-then-repopulate from the
//! before-image via `jsonb_populate_record`, which keeps the engine free of
//! per-entity SQL.

use async_trait::async_trait;
use sakti_engine::{InverseAction, Participant, ParticipantError};
use sakti_core::ResourceKind;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Maps a logical entity class onto its table.
#[derive(Debug, Clone)]
pub struct TableBinding {
    pub table: String,
    pub id_column: String,
}

impl TableBinding {
    pub fn new(table: impl Into<String>, id_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id_column: id_column.into(),
        }
    }
}

pub struct PgParticipant {
    name: String,
    pool: PgPool,
    bindings: HashMap<String, TableBinding>,
    active: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgParticipant {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
            bindings: HashMap::new(),
            active: Mutex::new(None),
        }
    }

    /// Register the table binding for an entity class.
    pub fn bind_entity(mut self, entity_class: impl Into<String>, binding: TableBinding) -> Self {
        self.bindings.insert(entity_class.into(), binding);
        self
    }

    fn binding(&self, entity_class: &str) -> Result<&TableBinding, ParticipantError> {
        self.bindings.get(entity_class).ok_or_else(|| {
            ParticipantError::new(format!(
                "no table binding for entity class '{entity_class}' on '{}'",
                self.name
            ))
        })
    }

    /// Run a statement inside the participant's open local transaction.
    /// This is how business repositories write through an enlisted
    /// datasource.
    pub async fn exec_in_tx(&self, sql: &str, params: &[Value]) -> Result<u64, ParticipantError> {
        let mut guard = self.active.lock().await;
        let tx = guard
            .as_mut()
            .ok_or_else(|| ParticipantError::new("no open transaction (enlist first)"))?;
        let q = bind_values(sqlx::query(sql), params);
        let done = q
            .execute(&mut **tx)
            .await
            .map_err(|e| ParticipantError::new(format!("exec failed: {e}")))?;
        Ok(done.rows_affected())
    }

    async fn delete_by_id(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<u64, ParticipantError> {
        let b = self.binding(entity_class)?;
        let sql = format!(
            r#"delete from {} where {}::text = $1"#,
            quote_ident(&b.table),
            quote_ident(&b.id_column)
        );
        let done = sqlx::query(&sql)
            .bind(entity_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| ParticipantError::new(format!("inverse delete failed: {e}")))?;
        Ok(done.rows_affected())
    }

    async fn restore_image(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        entity_class: &str,
        entity_id: Option<&str>,
        image: &Value,
    ) -> Result<(), ParticipantError> {
        let b = self.binding(entity_class)?;

        // Overwrite = delete any current row, then repopulate the full row
        // from the canonical image. Runs inside one transaction, so readers
        // never observe the gap.
        let id_owned;
        let id = match entity_id {
            Some(id) => id,
            None => {
                id_owned = image
                    .get(b.id_column.as_str())
                    .map(value_as_id)
                    .ok_or_else(|| {
                        ParticipantError::new(format!(
                            "before-image for '{entity_class}' lacks id column '{}'",
                            b.id_column
                        ))
                    })?;
                &id_owned
            }
        };

        let delete_sql = format!(
            r#"delete from {} where {}::text = $1"#,
            quote_ident(&b.table),
            quote_ident(&b.id_column)
        );
        sqlx::query(&delete_sql)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| ParticipantError::new(format!("restore delete failed: {e}")))?;

        let insert_sql = format!(
            r#"insert into {t} select * from jsonb_populate_record(null::{t}, $1)"#,
            t = quote_ident(&b.table)
        );
        sqlx::query(&insert_sql)
            .bind(image)
            .execute(&mut **tx)
            .await
            .map_err(|e| ParticipantError::new(format!("restore insert failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Participant for PgParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    async fn begin(&self) -> Result<(), ParticipantError> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            // Re-enlistment of an already-open participant is a no-op.
            return Ok(());
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ParticipantError::new(format!("begin failed: {e}")))?;
        *guard = Some(tx);
        Ok(())
    }

    async fn commit(&self) -> Result<(), ParticipantError> {
        let tx = self
            .active
            .lock()
            .await
            .take()
            .ok_or_else(|| ParticipantError::new("commit without open transaction"))?;
        tx.commit()
            .await
            .map_err(|e| ParticipantError::new(format!("commit failed: {e}")))
    }

    async fn rollback(&self) -> Result<(), ParticipantError> {
        // Idempotent: rolling back with nothing open is fine (the
        // transaction may never have begun, or already resolved).
        let maybe_tx = self.active.lock().await.take();
        if let Some(tx) = maybe_tx {
            tx.rollback()
                .await
                .map_err(|e| ParticipantError::new(format!("rollback failed: {e}")))?;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), ParticipantError> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| ParticipantError::new(format!("probe failed: {e}")))
    }

    async fn apply_inverse(&self, action: &InverseAction<'_>) -> Result<(), ParticipantError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ParticipantError::new(format!("compensation begin failed: {e}")))?;

        match action {
            InverseAction::DeleteById {
                entity_class,
                entity_id,
            } => {
                let n = self.delete_by_id(&mut tx, entity_class, entity_id).await?;
                // Zero rows is fine: a re-run, or an insert that never
                // became visible.
                debug!(participant = %self.name, entity_class, entity_id, rows = n, "inverse delete");
            }
            InverseAction::RestoreImage {
                entity_class,
                entity_id,
                image,
            } => {
                self.restore_image(&mut tx, entity_class, *entity_id, image)
                    .await?;
            }
            InverseAction::RestoreRows { entity_class, rows } => {
                for row in *rows {
                    self.restore_image(&mut tx, entity_class, None, row).await?;
                }
            }
            InverseAction::ExecuteSql { sql, params } => {
                let q = bind_values(sqlx::query(sql), params);
                q.execute(&mut *tx)
                    .await
                    .map_err(|e| ParticipantError::new(format!("inverse sql failed: {e}")))?;
            }
            InverseAction::CallProcedure { name, params } => {
                let placeholders = (1..=params.len())
                    .map(|i| format!("${i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("call {}({placeholders})", quote_qualified(name));
                let q = bind_values(sqlx::query(&sql), params);
                q.execute(&mut *tx)
                    .await
                    .map_err(|e| ParticipantError::new(format!("inverse procedure failed: {e}")))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| ParticipantError::new(format!("compensation commit failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Binding helpers
// ---------------------------------------------------------------------------

fn bind_values<'q>(
    mut q: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for p in params {
        q = match p {
            Value::Null => q.bind(None::<String>),
            Value::Bool(b) => q.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    q.bind(i)
                } else {
                    q.bind(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => q.bind(s.as_str()),
            // Arrays and objects go down as jsonb.
            other => q.bind(other),
        };
    }
    q
}

fn value_as_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name (`schema.proc`).
fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}
