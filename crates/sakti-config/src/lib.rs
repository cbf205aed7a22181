//! Coordinator configuration loading.
//!
//! Configuration is layered YAML, but layering is typed, not textual: each
//! file binds to a partial overlay of the recognised coordinator sections
//! and is applied field-by-field over the defaults, so a layer can only
//! touch options it names and an unrecognised section can never smuggle in
//! behavior. The effective settings (defaults filled, overlays applied,
//! env overrides in) are validated against the coordinator's operational
//! invariants and fingerprinted; nodes that share a lock keyspace and
//! recovery duties compare fingerprints before touching shared state.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;

mod settings;

pub use settings::{
    CoordinatorConfig, DegradeConfig, IdempotencyConfig, KvConfig, LockConfig, RecoveryConfig,
    ValidationConfig,
};

use settings::{SettingsOverlay, KNOWN_SECTIONS};

/// Env var overriding the KV store endpoint. The database URL is read by
/// `sakti-db` from its own env var; it never lives in the YAML document.
pub const ENV_KV_URL: &str = "SAKTI_KV_URL";

/// The effective coordinator configuration of this node.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: CoordinatorConfig,
    /// Fingerprint of `settings` (see [`CoordinatorConfig::fingerprint`]).
    pub fingerprint: String,
    /// Top-level document sections the coordinator does not recognise
    /// (deployment metadata, alerting blocks). Carried so the embedder can
    /// log them; they never influence the settings or the fingerprint.
    pub ignored_sections: Vec<String>,
}

impl LoadedConfig {
    /// Cross-node settings agreement. Two coordinators may share a lock
    /// keyspace and recovery duties only when their effective settings
    /// match: a node with a shorter lock lease or stall threshold would
    /// recover transactions its peer still considers live.
    ///
    /// # Errors
    /// Fails with both fingerprints in the message when they differ.
    pub fn assert_agrees_with(&self, peer_fingerprint: &str) -> Result<()> {
        if self.fingerprint != peer_fingerprint {
            bail!(
                "coordinator settings disagree: local fingerprint {} vs peer {}; \
                 refusing to share lock/recovery duties",
                self.fingerprint,
                peer_fingerprint
            );
        }
        Ok(())
    }
}

/// Load configuration layers in order. Later files override earlier ones
/// field-by-field; the result is validated and fingerprinted.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut settings = CoordinatorConfig::default();
    let mut ignored_sections = Vec::new();

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let doc = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        apply_layer(&doc, &mut settings, &mut ignored_sections)
            .with_context(|| format!("bind config layer: {p}"))?;
    }

    finish(settings, ignored_sections)
}

/// Bind a single already-parsed document. For tests and embedders that
/// assemble configuration without touching the filesystem.
pub fn from_document(doc: Value) -> Result<LoadedConfig> {
    let mut settings = CoordinatorConfig::default();
    let mut ignored_sections = Vec::new();
    apply_layer(&doc, &mut settings, &mut ignored_sections)?;
    finish(settings, ignored_sections)
}

fn apply_layer(
    doc: &Value,
    settings: &mut CoordinatorConfig,
    ignored_sections: &mut Vec<String>,
) -> Result<()> {
    match doc {
        // An empty file parses as null; a layer is allowed to be empty.
        Value::Null => return Ok(()),
        Value::Object(map) => {
            for key in map.keys() {
                if !KNOWN_SECTIONS.contains(&key.as_str())
                    && !ignored_sections.contains(key)
                {
                    ignored_sections.push(key.clone());
                }
            }
        }
        other => bail!("config document must be a mapping, got {other}"),
    }

    let overlay: SettingsOverlay =
        serde_json::from_value(doc.clone()).context("overlay bind failed")?;
    overlay.apply(settings);
    Ok(())
}

fn finish(mut settings: CoordinatorConfig, ignored_sections: Vec<String>) -> Result<LoadedConfig> {
    settings.apply_env_overrides();
    settings.validate()?;
    let fingerprint = settings.fingerprint();
    Ok(LoadedConfig {
        settings,
        fingerprint,
        ignored_sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tmp file");
        f.write_all(content.as_bytes()).expect("write tmp");
        f
    }

    #[test]
    fn later_layer_overrides_earlier_field_by_field() {
        let base = write_tmp("lock:\n  wait_ms: 5000\n  lease_ms: 30000\n");
        let over = write_tmp("lock:\n  wait_ms: 100\n");

        let loaded = load_layered_yaml(&[
            base.path().to_str().unwrap(),
            over.path().to_str().unwrap(),
        ])
        .unwrap();

        assert_eq!(loaded.settings.lock.wait_ms, 100);
        assert_eq!(
            loaded.settings.lock.lease_ms,
            30_000,
            "field the later layer does not name survives"
        );
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = from_document(serde_json::json!({})).unwrap().settings;
        assert_eq!(cfg.lock.wait_ms, 5_000);
        assert_eq!(cfg.lock.lease_ms, 30_000);
        assert_eq!(cfg.lock.prefix, "sakti:lock:");
        assert_eq!(cfg.idempotency.ttl_seconds, 7_200);
        assert_eq!(cfg.idempotency.prefix, "sakti:idemp:");
        assert_eq!(cfg.kv.endpoint, "localhost:6379");
        assert_eq!(cfg.validation.long_running_threshold_ms, 30_000);
        assert_eq!(cfg.recovery.interval_ms, 60_000);
        assert_eq!(cfg.recovery.stall_threshold_ms, 300_000);
        assert_eq!(cfg.recovery.max_retries, 5);
        assert!(cfg.degrade.on_kv_outage);
    }

    #[test]
    fn fingerprint_reflects_effective_settings_not_document_shape() {
        // One node spells a default out, the other leaves it implicit;
        // their effective settings are identical and so must agree.
        let explicit = from_document(serde_json::json!({"lock": {"wait_ms": 5000}})).unwrap();
        let implicit = from_document(serde_json::json!({})).unwrap();
        assert_eq!(explicit.fingerprint, implicit.fingerprint);
        explicit.assert_agrees_with(&implicit.fingerprint).unwrap();
    }

    #[test]
    fn disagreeing_nodes_are_refused() {
        let a = from_document(serde_json::json!({})).unwrap();
        let b = from_document(serde_json::json!({"lock": {"lease_ms": 60000}})).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
        let err = a.assert_agrees_with(&b.fingerprint).unwrap_err();
        assert!(err.to_string().contains("refusing to share"));
    }

    #[test]
    fn unknown_sections_are_reported_not_merged() {
        let loaded = from_document(serde_json::json!({
            "alerting": {"pagerduty_key": "x"},
            "recovery": {"max_retries": 3}
        }))
        .unwrap();
        assert_eq!(loaded.ignored_sections, vec!["alerting".to_string()]);
        assert_eq!(loaded.settings.recovery.max_retries, 3);
    }

    #[test]
    fn invalid_effective_settings_are_rejected() {
        // Stall threshold below the lock lease would let two nodes work
        // the same transaction.
        let err = from_document(serde_json::json!({
            "recovery": {"stall_threshold_ms": 1000}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("stall_threshold_ms"));

        let err = from_document(serde_json::json!({
            "lock": {"prefix": "no-colon"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("lock.prefix"));
    }

    #[test]
    fn scalar_document_is_refused() {
        let err = from_document(serde_json::json!("just a string")).unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn empty_yaml_layer_is_tolerated() {
        let base = write_tmp("");
        let over = write_tmp("recovery:\n  max_retries: 2\n");
        let loaded = load_layered_yaml(&[
            base.path().to_str().unwrap(),
            over.path().to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(loaded.settings.recovery.max_retries, 2);
    }
}
