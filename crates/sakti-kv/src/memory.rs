//! In-memory KV backend.
//!
//! Single-process stand-in for the replicated store: expiring string map
//! plus an outage toggle so tests can exercise degrade mode without a real
//! partition. Mutex is held only for map access, never across an await.

use crate::client::{KvClient, KvError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    published: Vec<(String, String)>,
    online: bool,
}

/// In-memory [`KvClient`] for tests and single-node setups.
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                published: Vec::new(),
                online: true,
            }),
        }
    }

    /// Simulate a store outage (`false`) or recovery (`true`). While
    /// offline every operation returns [`KvError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.inner.lock().expect("kv mutex poisoned").online = online;
    }

    /// Force a key to expire immediately (lease-expiry tests).
    pub fn force_expire(&self, key: &str) {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");
        inner.map.remove(key);
    }

    /// Drain captured pub/sub messages.
    pub fn take_published(&self) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().expect("kv mutex poisoned");
        std::mem::take(&mut inner.published)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Inner>, KvError> {
        let inner = self.inner.lock().expect("kv mutex poisoned");
        if !inner.online {
            return Err(KvError::Unavailable("memory kv offline".to_string()));
        }
        Ok(inner)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn ping(&self) -> Result<(), KvError> {
        self.guard().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.guard()?;
        let now = Instant::now();
        if inner.map.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.map.remove(key);
        }
        Ok(inner.map.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.guard()?;
        inner.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.guard()?;
        let now = Instant::now();
        let live = match inner.map.get(key) {
            Some(e) if !e.is_expired(now) => true,
            Some(_) => {
                inner.map.remove(key);
                false
            }
            None => false,
        };
        if live {
            return Ok(false);
        }
        inner.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.guard()?;
        inner.map.remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut inner = self.guard()?;
        let now = Instant::now();
        let matches = match inner.map.get(key) {
            Some(e) if !e.is_expired(now) => e.value == expected,
            _ => false,
        };
        if matches {
            inner.map.remove(key);
        }
        Ok(matches)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut inner = self.guard()?;
        inner
            .published
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
