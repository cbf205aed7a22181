//! Typed coordinator settings.
//!
//! Field names and defaults mirror the recognised option table. Layering
//! is typed: a YAML layer binds to [`SettingsOverlay`] (every field
//! optional) and is applied field-by-field, so a layer only touches what
//! it names and can never silently reset a sibling option to its default.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Top-level coordinator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub degrade: DegradeConfig,
}

impl CoordinatorConfig {
    /// Apply environment overrides (`SAKTI_KV_URL`). The database URL is
    /// read by `sakti-db` directly; it never lives in the YAML document.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(ep) = std::env::var(crate::ENV_KV_URL) {
            if !ep.is_empty() {
                self.kv.endpoint = ep;
            }
        }
    }

    /// Operational sanity rules. These guard cross-component invariants a
    /// per-field serde default cannot express.
    ///
    /// The stall rule is the important one: a row must never become
    /// recovery-eligible while its coordinator could still hold a live
    /// lock lease, or two nodes would work the same transaction.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.lock.lease_ms > 0, "lock.lease_ms must be positive");
        ensure!(
            keyspace_prefix_ok(&self.lock.prefix),
            "lock.prefix must be a non-empty keyspace prefix ending in ':' (got '{}')",
            self.lock.prefix
        );
        ensure!(
            keyspace_prefix_ok(&self.idempotency.prefix),
            "idempotency.prefix must be a non-empty keyspace prefix ending in ':' (got '{}')",
            self.idempotency.prefix
        );
        ensure!(
            self.idempotency.ttl_seconds > 0,
            "idempotency.ttl_seconds must be positive"
        );
        ensure!(
            !self.kv.endpoint.is_empty(),
            "kv.endpoint must not be empty"
        );
        ensure!(
            self.recovery.interval_ms > 0,
            "recovery.interval_ms must be positive"
        );
        ensure!(
            self.recovery.max_retries >= 1,
            "recovery.max_retries must be at least 1"
        );
        ensure!(
            self.recovery.stall_threshold_ms >= self.lock.lease_ms,
            "recovery.stall_threshold_ms ({}) must not undercut lock.lease_ms ({}): \
             a stalled row may still have a live lease holder",
            self.recovery.stall_threshold_ms,
            self.lock.lease_ms
        );
        Ok(())
    }

    /// Fingerprint of the *effective* settings: defaults filled, overlays
    /// applied, env overrides in. Nodes that share lock keyspace and
    /// recovery duties compare fingerprints before touching shared state;
    /// two nodes with differently-shaped YAML but equal effective settings
    /// agree, which a hash of the raw documents could never tell.
    ///
    /// Serde emits struct fields in declaration order, so the serialized
    /// form is canonical without extra sorting.
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_string(self).expect("settings serialization must not fail");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn keyspace_prefix_ok(prefix: &str) -> bool {
    !prefix.is_empty() && prefix.ends_with(':')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Max wait to acquire a lock, milliseconds.
    #[serde(default = "default_lock_wait_ms")]
    pub wait_ms: u64,
    /// Lease granted to a holder, milliseconds. Bounds how long a crashed
    /// holder can block others.
    #[serde(default = "default_lock_lease_ms")]
    pub lease_ms: u64,
    /// Keyspace prefix for lock entries.
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_lock_wait_ms(),
            lease_ms: default_lock_lease_ms(),
            prefix: default_lock_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// TTL of processing/completed markers, seconds.
    #[serde(default = "default_idemp_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Keyspace prefix for idempotency markers.
    #[serde(default = "default_idemp_prefix")]
    pub prefix: String,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_idemp_ttl_seconds(),
            prefix: default_idemp_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// KV store address, `host:port`.
    #[serde(default = "default_kv_endpoint")]
    pub endpoint: String,
}

impl KvConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("redis://{}", self.endpoint)
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            endpoint: default_kv_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Elapsed time past which a transaction is flagged long-running, ms.
    #[serde(default = "default_long_running_threshold_ms")]
    pub long_running_threshold_ms: u64,
}

impl ValidationConfig {
    pub fn long_running_threshold(&self) -> Duration {
        Duration::from_millis(self.long_running_threshold_ms)
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            long_running_threshold_ms: default_long_running_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Scanner interval, ms.
    #[serde(default = "default_recovery_interval_ms")]
    pub interval_ms: u64,
    /// A PENDING row must be idle this long before recovery touches it, ms.
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Retry cap before a row is marked FAILED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_recovery_interval_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradeConfig {
    /// Proceed without lock/idempotency when the KV store is down.
    /// Callers see the bypass as risk flags, not as a failure.
    #[serde(default = "default_degrade_on_kv_outage")]
    pub on_kv_outage: bool,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            on_kv_outage: default_degrade_on_kv_outage(),
        }
    }
}

// ---------------------------------------------------------------------------
// Layer overlays
// ---------------------------------------------------------------------------

/// The sections a configuration document may carry. Anything else is
/// operational baggage the loader reports as ignored.
pub(crate) const KNOWN_SECTIONS: [&str; 6] = [
    "lock",
    "idempotency",
    "kv",
    "validation",
    "recovery",
    "degrade",
];

/// One configuration layer. Every field is optional: binding a layer and
/// applying it touches exactly the options the document names.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SettingsOverlay {
    #[serde(default)]
    lock: LockOverlay,
    #[serde(default)]
    idempotency: IdempotencyOverlay,
    #[serde(default)]
    kv: KvOverlay,
    #[serde(default)]
    validation: ValidationOverlay,
    #[serde(default)]
    recovery: RecoveryOverlay,
    #[serde(default)]
    degrade: DegradeOverlay,
}

impl SettingsOverlay {
    pub(crate) fn apply(self, cfg: &mut CoordinatorConfig) {
        if let Some(v) = self.lock.wait_ms {
            cfg.lock.wait_ms = v;
        }
        if let Some(v) = self.lock.lease_ms {
            cfg.lock.lease_ms = v;
        }
        if let Some(v) = self.lock.prefix {
            cfg.lock.prefix = v;
        }
        if let Some(v) = self.idempotency.ttl_seconds {
            cfg.idempotency.ttl_seconds = v;
        }
        if let Some(v) = self.idempotency.prefix {
            cfg.idempotency.prefix = v;
        }
        if let Some(v) = self.kv.endpoint {
            cfg.kv.endpoint = v;
        }
        if let Some(v) = self.validation.long_running_threshold_ms {
            cfg.validation.long_running_threshold_ms = v;
        }
        if let Some(v) = self.recovery.interval_ms {
            cfg.recovery.interval_ms = v;
        }
        if let Some(v) = self.recovery.stall_threshold_ms {
            cfg.recovery.stall_threshold_ms = v;
        }
        if let Some(v) = self.recovery.max_retries {
            cfg.recovery.max_retries = v;
        }
        if let Some(v) = self.degrade.on_kv_outage {
            cfg.degrade.on_kv_outage = v;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LockOverlay {
    wait_ms: Option<u64>,
    lease_ms: Option<u64>,
    prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IdempotencyOverlay {
    ttl_seconds: Option<u64>,
    prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KvOverlay {
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ValidationOverlay {
    long_running_threshold_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RecoveryOverlay {
    interval_ms: Option<u64>,
    stall_threshold_ms: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DegradeOverlay {
    on_kv_outage: Option<bool>,
}

fn default_lock_wait_ms() -> u64 {
    5_000
}
fn default_lock_lease_ms() -> u64 {
    30_000
}
fn default_lock_prefix() -> String {
    "sakti:lock:".to_string()
}
fn default_idemp_ttl_seconds() -> u64 {
    7_200
}
fn default_idemp_prefix() -> String {
    "sakti:idemp:".to_string()
}
fn default_kv_endpoint() -> String {
    "localhost:6379".to_string()
}
fn default_long_running_threshold_ms() -> u64 {
    30_000
}
fn default_recovery_interval_ms() -> u64 {
    60_000
}
fn default_stall_threshold_ms() -> u64 {
    300_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_degrade_on_kv_outage() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_url_prefixes_scheme_when_missing() {
        let kv = KvConfig {
            endpoint: "kv.internal:6380".to_string(),
        };
        assert_eq!(kv.url(), "redis://kv.internal:6380");

        let kv = KvConfig {
            endpoint: "rediss://kv.internal:6380".to_string(),
        };
        assert_eq!(kv.url(), "rediss://kv.internal:6380");
    }

    #[test]
    fn durations_convert_from_millis() {
        let lock = LockConfig::default();
        assert_eq!(lock.wait(), Duration::from_millis(5_000));
        assert_eq!(lock.lease(), Duration::from_millis(30_000));

        let rec = RecoveryConfig::default();
        assert_eq!(rec.stall_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn overlay_touches_only_named_fields() {
        let mut cfg = CoordinatorConfig::default();
        let overlay: SettingsOverlay =
            serde_json::from_value(serde_json::json!({"recovery": {"max_retries": 2}})).unwrap();
        overlay.apply(&mut cfg);
        assert_eq!(cfg.recovery.max_retries, 2);
        assert_eq!(cfg.recovery.interval_ms, 60_000);
        assert_eq!(cfg.lock.prefix, "sakti:lock:");
    }

    #[test]
    fn defaults_pass_validation() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn stall_threshold_must_cover_the_lock_lease() {
        let mut cfg = CoordinatorConfig::default();
        cfg.lock.lease_ms = 30_000;
        cfg.recovery.stall_threshold_ms = 10_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stall_threshold_ms"));
    }

    #[test]
    fn keyspace_prefixes_must_end_with_colon() {
        let mut cfg = CoordinatorConfig::default();
        cfg.lock.prefix = "sakti-lock".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = CoordinatorConfig::default();
        cfg.idempotency.prefix = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retries_is_rejected() {
        let mut cfg = CoordinatorConfig::default();
        cfg.recovery.max_retries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fingerprint_is_deterministic_and_sensitive() {
        let a = CoordinatorConfig::default();
        let b = CoordinatorConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = CoordinatorConfig::default();
        c.lock.lease_ms += 1;
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
