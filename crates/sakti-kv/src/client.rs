//! KV client contract.
//!
//! Implementations must be object-safe so callers can hold an
//! `Arc<dyn KvClient>` without knowing the backend, and `Send + Sync` so
//! they can be shared across task boundaries.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a [`KvClient`] implementation may return.
///
/// `Unavailable` is the variant degrade mode keys off: it means the store
/// itself could not be reached (connection refused, timeout, partition).
/// `Backend` covers everything else: the store answered, but the operation
/// failed.
#[derive(Debug, Clone)]
pub enum KvError {
    /// The store is unreachable.
    Unavailable(String),
    /// The store answered with an error.
    Backend(String),
}

impl KvError {
    /// `true` when degrade mode may bypass the operation.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KvError::Unavailable(_))
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Unavailable(msg) => write!(f, "kv store unavailable: {msg}"),
            KvError::Backend(msg) => write!(f, "kv backend error: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Opaque interface to the replicated KV store.
///
/// The lock manager builds mutual exclusion out of `set_nx_px` +
/// `del_if_eq`; everything else is plain TTL'd strings plus pub/sub
/// notification. No operation here is allowed to block indefinitely.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), KvError>;

    /// Read a key. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a key with a TTL, overwriting any previous value.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Write a key with a TTL only if it does not already exist.
    /// Returns `true` when the write won.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete a key unconditionally.
    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Delete a key only if its current value equals `expected`, atomically.
    /// Returns `true` when the delete happened. This is what makes lock
    /// release safe after lease expiry: a successor's lease is never removed.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Fire-and-forget pub/sub notification.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use std::sync::Arc;

    #[test]
    fn kv_error_display() {
        let e = KvError::Unavailable("connection refused".to_string());
        assert_eq!(e.to_string(), "kv store unavailable: connection refused");
        assert!(e.is_unavailable());

        let e = KvError::Backend("WRONGTYPE".to_string());
        assert_eq!(e.to_string(), "kv backend error: WRONGTYPE");
        assert!(!e.is_unavailable());
    }

    #[test]
    fn client_is_object_safe_via_arc() {
        // Compile-time proof: trait object can be constructed.
        let _c: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
    }
}
