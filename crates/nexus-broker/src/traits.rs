use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Options for a `SET` call (spec.md §6: string SET with NX/EX variants).
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Only set if the key does not already exist.
    pub nx: bool,
    /// Expire after this many seconds.
    pub ex: Option<u64>,
}

impl SetOptions {
    pub fn ex(seconds: u64) -> Self {
        Self {
            nx: false,
            ex: Some(seconds),
        }
    }

    pub fn nx_ex(seconds: u64) -> Self {
        Self {
            nx: true,
            ex: Some(seconds),
        }
    }
}

/// A single stream entry: broker-assigned ID plus field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

/// A pub/sub message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Where an `XREADGROUP`/`XAUTOCLAIM` read should start.
#[derive(Debug, Clone, Copy)]
pub enum StreamStart {
    /// Only entries not yet delivered to the group.
    NewOnly,
    /// From the beginning of the stream.
    Beginning,
}

/// A nearest-neighbor hit from a vector search.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub key: String,
    pub distance: f32,
}

/// Abstraction over every broker operation the clustering core needs.
///
/// Implemented by [`crate::redis::RedisBroker`] against a real Redis-
/// compatible server, and by [`crate::memory::MemoryBroker`] as an
/// in-process fake for tests. Components in `nexus-cluster` are generic
/// over this trait so they never depend on the wire protocol directly.
#[async_trait]
pub trait Broker: Send + Sync {
    // -- strings ---------------------------------------------------------
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Returns `true` if the key was set (always true unless `nx` was
    /// requested and the key already existed).
    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> Result<bool>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn incrby(&self, key: &str, delta: i64) -> Result<i64>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    /// Conditional delete: only deletes if the stored value equals `expected`.
    /// Used to release locks/records only if still owned by the caller.
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;
    async fn ttl(&self, key: &str) -> Result<Option<i64>>;

    // -- hashes ------------------------------------------------------------
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hset_all(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>>;

    // -- ordered sets --------------------------------------------------
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Members (and scores) with score strictly less than `max_age_cutoff`,
    /// i.e. `score < cutoff`. Used for stale-session cleanup.
    async fn zrangebyscore_lt(&self, key: &str, cutoff: f64) -> Result<Vec<String>>;

    // -- pub/sub -----------------------------------------------------------
    /// Publishes `payload` to `channel`, returning the broker-reported
    /// subscriber count.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64>;
    /// Subscribes to one or more channels, returning a receiver fed by a
    /// background task. Dropping the receiver unsubscribes.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<BrokerMessage>>;

    // -- streams -------------------------------------------------------
    async fn xadd(&self, stream: &str, fields: &[(&str, Vec<u8>)]) -> Result<String>;
    async fn xgroup_create(&self, stream: &str, group: &str, start: StreamStart) -> Result<()>;
    /// Reads up to `count` new entries for `group`/`consumer` from each of
    /// `streams`, blocking up to `block_ms` if none are immediately ready.
    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, StreamEntry)>>;
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool>;
    /// Reclaims entries idle longer than `min_idle_ms`, reassigning them to
    /// `consumer`. Returns `Ok(None)` if the broker lacks auto-claim support
    /// (the caller should disable the claim loop, not treat this as fatal).
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>>;
    async fn xpending_count(&self, stream: &str, group: &str) -> Result<u64>;
    async fn xlen(&self, stream: &str) -> Result<u64>;
    async fn xrevrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;

    // -- keyspace / server -----------------------------------------------
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;

    // -- optional vector search module -----------------------------------
    /// Declares a vector index on `field` within hashes under `prefix`.
    /// Returns `Err(Unavailable)` if the broker has no vector-search module;
    /// callers fall back to brute-force scan on that error.
    async fn vector_index_create(
        &self,
        index_name: &str,
        prefix: &str,
        field: &str,
        dims: usize,
    ) -> Result<()>;
    async fn vector_search(
        &self,
        index_name: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>>;
    async fn vector_index_info(&self, index_name: &str) -> Result<Option<(usize, u64)>>;
}
