//! Distributed lock manager.
//!
//! A lock is a KV entry under the lock prefix whose value is the holder's
//! owner token and whose TTL is the lease. Acquisition polls `set_nx_px`
//! until it wins or the wait budget runs out. Fairness is best-effort
//! (whatever the store gives us); unfair degradation under partition is
//! acceptable.
//!
//! Release is compare-and-delete on the owner token, so it is idempotent
//! and safe after lease expiry: a successor's lease is never removed.

use crate::client::{KvClient, KvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Re-check cadence while waiting for a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Acquires and releases keyed leases against the KV store.
pub struct LockManager {
    kv: Arc<dyn KvClient>,
    prefix: String,
    degrade_on_outage: bool,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvClient>, prefix: impl Into<String>, degrade_on_outage: bool) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            degrade_on_outage,
        }
    }

    /// Try to acquire `key` within `wait`, holding it for at most `lease`.
    ///
    /// Never blocks past `wait`. Outcomes:
    /// - acquired handle: the caller holds the lease;
    /// - unacquired, non-degraded handle: the lock is held elsewhere;
    /// - unacquired handle tagged `degraded`: the store is unreachable and
    ///   degrade mode is on; the caller may elect to proceed without a lock.
    ///
    /// # Errors
    /// [`KvError::Unavailable`] when the store is unreachable and degrade
    /// mode is off.
    pub async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, KvError> {
        let full_key = format!("{}{}", self.prefix, key);
        let owner = owner_token(lease);
        let started = Instant::now();

        loop {
            match self.kv.set_nx_px(&full_key, &owner, lease).await {
                Ok(true) => {
                    return Ok(LockHandle {
                        kv: Arc::clone(&self.kv),
                        key: full_key,
                        owner,
                        acquired: AtomicBool::new(true),
                        degraded: false,
                    });
                }
                Ok(false) => {}
                Err(e) if e.is_unavailable() && self.degrade_on_outage => {
                    warn!(key = %full_key, error = %e, "kv outage during lock acquisition, degrading");
                    return Ok(LockHandle {
                        kv: Arc::clone(&self.kv),
                        key: full_key,
                        owner,
                        acquired: AtomicBool::new(false),
                        degraded: true,
                    });
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(LockHandle {
                    kv: Arc::clone(&self.kv),
                    key: full_key,
                    owner,
                    acquired: AtomicBool::new(false),
                    degraded: false,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait - elapsed)).await;
        }
    }
}

/// Owner token: process + random id + intended expiry, readable in the
/// store for operator inspection.
fn owner_token(lease: Duration) -> String {
    format!(
        "{}:{}:lease_ms={}",
        std::process::id(),
        Uuid::new_v4(),
        lease.as_millis()
    )
}

/// Scoped handle for one acquisition attempt.
pub struct LockHandle {
    kv: Arc<dyn KvClient>,
    key: String,
    owner: String,
    acquired: AtomicBool,
    degraded: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("acquired", &self.acquired)
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl LockHandle {
    /// `true` when the lease was won.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// `true` when the store was unreachable and the handle was issued
    /// without a lease (degrade mode).
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Fully-prefixed lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease. Idempotent; safe to call after expiry. A release
    /// that finds someone else's token leaves it untouched.
    pub async fn release(&self) {
        if !self.acquired.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.kv.del_if_eq(&self.key, &self.owner).await {
            Ok(true) => {}
            Ok(false) => {
                // Lease already expired and possibly re-acquired by another
                // owner; nothing to clean up.
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "lock release failed; lease will expire on its own");
            }
        }
    }
}
