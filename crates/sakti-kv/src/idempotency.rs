//! Idempotency markers.
//!
//! One marker per caller-supplied business key, value `processing:<ms>` or
//! `completed:<ms>` with TTL. The state transition is monotonic:
//! `missing → processing → completed`, or `processing → missing` when the
//! business action failed before completion (so a well-formed retry can
//! proceed). The coordinator double-checks `exists`: once before lock
//! acquisition (fast fail) and once after (anti-race).

use crate::client::{KvClient, KvError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Observed marker state for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyState {
    Missing,
    Processing,
    Completed,
}

/// Records processing/completed state for business keys with TTL.
pub struct IdempotencyStore {
    kv: Arc<dyn KvClient>,
    prefix: String,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KvClient>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Current marker state.
    pub async fn state(&self, key: &str) -> Result<IdempotencyState, KvError> {
        let v = self.kv.get(&self.key(key)).await?;
        Ok(match v.as_deref() {
            None => IdempotencyState::Missing,
            Some(s) if s.starts_with("completed:") => IdempotencyState::Completed,
            Some(s) if s.starts_with("processing:") => IdempotencyState::Processing,
            // Unknown payloads under our prefix are treated as in-flight:
            // refusing a duplicate is safer than double-processing.
            Some(_) => IdempotencyState::Processing,
        })
    }

    /// `true` when any marker exists for `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.state(key).await? != IdempotencyState::Missing)
    }

    /// Mark the key as in-flight.
    pub async fn mark_processing(&self, key: &str) -> Result<(), KvError> {
        let value = format!("processing:{}", epoch_ms());
        self.kv.set_ex(&self.key(key), &value, self.ttl).await
    }

    /// Promote the key to completed. Monotonic: completion overwrites the
    /// processing marker and refreshes the TTL.
    pub async fn mark_completed(&self, key: &str) -> Result<(), KvError> {
        let value = format!("completed:{}", epoch_ms());
        self.kv.set_ex(&self.key(key), &value, self.ttl).await
    }

    /// Delete the marker after a failed business action so a retry with the
    /// same key can proceed. Only valid before `mark_completed`.
    pub async fn rollback(&self, key: &str) -> Result<(), KvError> {
        self.kv.del(&self.key(key)).await
    }
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    fn store(kv: &Arc<MemoryKv>) -> IdempotencyStore {
        IdempotencyStore::new(
            Arc::clone(kv) as Arc<dyn KvClient>,
            "sakti:idemp:",
            Duration::from_secs(7_200),
        )
    }

    #[tokio::test]
    async fn lifecycle_missing_processing_completed() {
        let kv = Arc::new(MemoryKv::new());
        let s = store(&kv);

        assert_eq!(s.state("op-1").await.unwrap(), IdempotencyState::Missing);
        assert!(!s.exists("op-1").await.unwrap());

        s.mark_processing("op-1").await.unwrap();
        assert_eq!(s.state("op-1").await.unwrap(), IdempotencyState::Processing);
        assert!(s.exists("op-1").await.unwrap());

        s.mark_completed("op-1").await.unwrap();
        assert_eq!(s.state("op-1").await.unwrap(), IdempotencyState::Completed);
    }

    #[tokio::test]
    async fn rollback_clears_processing_marker() {
        let kv = Arc::new(MemoryKv::new());
        let s = store(&kv);

        s.mark_processing("op-1").await.unwrap();
        s.rollback("op-1").await.unwrap();
        assert_eq!(s.state("op-1").await.unwrap(), IdempotencyState::Missing);
    }

    #[tokio::test]
    async fn marker_value_carries_state_prefix() {
        let kv = Arc::new(MemoryKv::new());
        let s = store(&kv);

        s.mark_processing("op-1").await.unwrap();
        let raw = kv.get("sakti:idemp:op-1").await.unwrap().unwrap();
        assert!(raw.starts_with("processing:"), "got {raw}");

        s.mark_completed("op-1").await.unwrap();
        let raw = kv.get("sakti:idemp:op-1").await.unwrap().unwrap();
        assert!(raw.starts_with("completed:"), "got {raw}");
    }

    #[tokio::test]
    async fn unknown_payload_reads_as_processing() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_ex("sakti:idemp:op-1", "garbage", Duration::from_secs(60))
            .await
            .unwrap();
        let s = store(&kv);
        assert_eq!(s.state("op-1").await.unwrap(), IdempotencyState::Processing);
    }
}
