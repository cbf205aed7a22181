// crates/sakti-db/src/lib.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sakti_core::{JournalPayload, TxLogStatus};
use sakti_engine::{TxLogRow, TxLogStore};
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub const ENV_DB_URL: &str = "SAKTI_DATABASE_URL";

mod participant;

pub use participant::{PgParticipant, TableBinding};

/// Connect to Postgres using SAKTI_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='tx_log'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_tx_log_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_tx_log_table: bool,
}

// ---------------------------------------------------------------------------
// Durable tx_log store
// ---------------------------------------------------------------------------

/// Postgres-backed [`TxLogStore`].
///
/// Row discipline: a row is written by the owning transaction, or by the
/// recovery worker while it holds the per-row advisory lock. The payload
/// column holds the serialized journal (entries + error message) as text.
pub struct PgTxLogStore {
    pool: PgPool,
}

impl PgTxLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn render_payload(payload: &JournalPayload) -> String {
    payload.to_value().to_string()
}

fn parse_payload(raw: Option<String>) -> Result<JournalPayload> {
    match raw.as_deref() {
        None | Some("") => Ok(JournalPayload::new()),
        Some(s) => serde_json::from_str(s).context("parse tx_log payload failed"),
    }
}

fn map_row(row: sqlx::postgres::PgRow) -> Result<TxLogRow> {
    let status_raw: String = row.try_get("status")?;
    let status = TxLogStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("invalid tx_log status: {status_raw}"))?;
    Ok(TxLogRow {
        tx_id: row.try_get("tx_id")?,
        business_key: row.try_get("business_key")?,
        status,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        last_update: row.try_get::<DateTime<Utc>, _>("last_update")?,
        retry_count: row.try_get("retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        payload: parse_payload(row.try_get("payload")?)?,
    })
}

#[async_trait]
impl TxLogStore for PgTxLogStore {
    async fn open_pending(&self, tx_id: &str, business_key: &str) -> Result<()> {
        sqlx::query(
            r#"
            insert into tx_log (tx_id, business_key, status)
            values ($1, $2, 'PENDING')
            on conflict (tx_id) do nothing
            "#,
        )
        .bind(tx_id)
        .bind(business_key)
        .execute(&self.pool)
        .await
        .context("tx_log open_pending failed")?;
        Ok(())
    }

    async fn record_payload(&self, tx_id: &str, payload: &JournalPayload) -> Result<()> {
        sqlx::query(
            r#"
            update tx_log
               set payload = $2,
                   last_update = now()
             where tx_id = $1
            "#,
        )
        .bind(tx_id)
        .bind(render_payload(payload))
        .execute(&self.pool)
        .await
        .context("tx_log record_payload failed")?;
        Ok(())
    }

    async fn mark_status(
        &self,
        tx_id: &str,
        status: TxLogStatus,
        payload: Option<&JournalPayload>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update tx_log
               set status = $2,
                   payload = coalesce($3, payload),
                   last_update = now()
             where tx_id = $1
            "#,
        )
        .bind(tx_id)
        .bind(status.as_str())
        .bind(payload.map(render_payload))
        .execute(&self.pool)
        .await
        .context("tx_log mark_status failed")?;
        Ok(())
    }

    async fn fetch(&self, tx_id: &str) -> Result<Option<TxLogRow>> {
        let row = sqlx::query(
            r#"
            select tx_id, business_key, status, created_at, last_update,
                   retry_count, last_retry_at, payload
              from tx_log
             where tx_id = $1
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await
        .context("tx_log fetch failed")?;

        row.map(map_row).transpose()
    }

    async fn list_stalled(&self, stall: Duration, limit: i64) -> Result<Vec<TxLogRow>> {
        let rows = sqlx::query(
            r#"
            select tx_id, business_key, status, created_at, last_update,
                   retry_count, last_retry_at, payload
              from tx_log
             where status in ('PENDING', 'ROLLING_BACK')
               and last_update < now() - ($1::bigint * interval '1 millisecond')
             order by last_update asc
             limit $2
            "#,
        )
        .bind(stall.as_millis() as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("tx_log list_stalled failed")?;

        rows.into_iter().map(map_row).collect()
    }

    async fn bump_retry(&self, tx_id: &str) -> Result<i32> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            update tx_log
               set retry_count = retry_count + 1,
                   last_retry_at = now(),
                   last_update = now()
             where tx_id = $1
            returning retry_count
            "#,
        )
        .bind(tx_id)
        .fetch_one(&self.pool)
        .await
        .context("tx_log bump_retry failed")?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sakti_core::{OperationEntry, OperationKind};

    #[test]
    fn payload_rendering_roundtrips() {
        let mut p = JournalPayload::new();
        p.push(OperationEntry {
            sequence: 1,
            datasource: "dbA".to_string(),
            op: OperationKind::Insert,
            entity_class: "Account".to_string(),
            entity_id: Some("1".to_string()),
            before_image: None,
            inverse: None,
            compensated: false,
            compensation_error: None,
        });
        p.error = Some("boom".to_string());

        let text = render_payload(&p);
        let back = parse_payload(Some(text)).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.error.as_deref(), Some("boom"));
    }

    #[test]
    fn empty_payload_column_parses_as_empty_journal() {
        assert_eq!(parse_payload(None).unwrap().entries.len(), 0);
        assert_eq!(parse_payload(Some(String::new())).unwrap().entries.len(), 0);
    }
}
