//! Replicated KV store plumbing: client abstraction, distributed locks,
//! idempotency markers and the reserved cache bucket.
//!
//! Everything above this crate talks to the store through [`KvClient`]; the
//! concrete backend (in-memory for tests, redis in deployment) is chosen at
//! wiring time. TTLs are mandatory on every write; the store is a lease
//! surface, not a system of record.

mod cache;
mod client;
mod idempotency;
mod lock;
mod memory;
mod redis_kv;

pub use cache::CacheBucket;
pub use client::{KvClient, KvError};
pub use idempotency::{IdempotencyState, IdempotencyStore};
pub use lock::{LockHandle, LockManager};
pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

/// Keyspace prefixes. All sakti keys live under these, all with TTL.
pub mod keyspace {
    /// Held lock leases.
    pub const LOCK: &str = "sakti:lock:";
    /// Idempotency markers (`processing:<ms>` / `completed:<ms>`).
    pub const IDEMPOTENCY: &str = "sakti:idemp:";
    /// Opaque cache payloads.
    pub const CACHE: &str = "sakti:cache:";
    /// Hot mirror of per-transaction journals.
    pub const TXLOG: &str = "sakti:txlog:";
}
