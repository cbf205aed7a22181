//! Reserved cache bucket (`sakti:cache:<key>`).
//!
//! Opaque TTL'd payloads only. This is deliberately not a general-purpose
//! cache API: no negative caching, no stampede control, no serialization
//! opinion.

use crate::client::{KvClient, KvError};
use std::sync::Arc;
use std::time::Duration;

pub struct CacheBucket {
    kv: Arc<dyn KvClient>,
}

impl CacheBucket {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    fn key(key: &str) -> String {
        format!("{}{}", crate::keyspace::CACHE, key)
    }

    pub async fn put(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), KvError> {
        self.kv.set_ex(&Self::key(key), payload, ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.kv.get(&Self::key(key)).await
    }

    pub async fn evict(&self, key: &str) -> Result<(), KvError> {
        self.kv.del(&Self::key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    #[tokio::test]
    async fn put_get_evict_under_cache_prefix() {
        let kv = Arc::new(MemoryKv::new());
        let cache = CacheBucket::new(Arc::clone(&kv) as Arc<dyn KvClient>);

        cache.put("fx-rates", "{}", Duration::from_secs(5)).await.unwrap();
        assert!(kv.get("sakti:cache:fx-rates").await.unwrap().is_some());
        assert_eq!(cache.get("fx-rates").await.unwrap().as_deref(), Some("{}"));

        cache.evict("fx-rates").await.unwrap();
        assert_eq!(cache.get("fx-rates").await.unwrap(), None);
    }
}
