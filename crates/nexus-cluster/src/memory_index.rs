//! Vector-indexed long-lived memory store with three-stage deduplication.
//! Grounded on `examples/original_source/backend/core/cluster/memory_index.py`.

use crate::error::{ClusterError, Result};
use nexus_broker::Broker;
use nexus_types::now_unix;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SIMILARITY_THRESHOLD: f32 = 0.12;
const INDEX_NAME: &str = "nexus_memory_idx";

/// A stored long-lived memory record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    pub memory_type: String,
    pub content: serde_json::Value,
    pub content_hash: String,
    pub created_at: i64,
    pub access_count: u64,
    pub last_accessed: i64,
}

/// Outcome of a `store` call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Inserted(String),
    DuplicateOf(String),
}

pub struct MemoryIndex<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    vector_dims: usize,
    /// Caps the brute-force fallback scan; a deliberate, logged divergence
    /// from the reference's unbounded scan (DESIGN.md Open Question #3).
    max_scan: usize,
    vector_module_available: AtomicBool,
}

impl<B: Broker> MemoryIndex<B> {
    pub fn new(broker: Arc<B>, prefix: String, vector_dims: usize) -> Self {
        Self {
            broker,
            prefix,
            vector_dims,
            max_scan: 10_000,
            vector_module_available: AtomicBool::new(true),
        }
    }

    fn memory_key(&self, memory_id: &str) -> String {
        format!("{}memory:{}", self.prefix, memory_id)
    }

    pub async fn ensure_index(&self) -> Result<()> {
        match self
            .broker
            .vector_index_create(INDEX_NAME, &format!("{}memory:", self.prefix), "embedding", self.vector_dims)
            .await
        {
            Ok(()) => {
                self.vector_module_available.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(nexus_broker::BrokerError::Unavailable(_)) => {
                tracing::warn!("vector search module unavailable, falling back to brute-force scan");
                self.vector_module_available.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stage 1: explicit ID. Stage 2: content-hash exact match. Stage 3:
    /// cosine-distance nearest neighbor below [`SIMILARITY_THRESHOLD`].
    pub async fn store(
        &self,
        memory_id: Option<&str>,
        memory_type: &str,
        content: &serde_json::Value,
        embedding: &[f32],
    ) -> Result<StoreOutcome> {
        if embedding.len() != self.vector_dims {
            return Err(ClusterError::DimensionMismatch {
                expected: self.vector_dims,
                got: embedding.len(),
            });
        }

        if let Some(id) = memory_id {
            if self.broker.hget(&self.memory_key(id), "content").await?.is_some() {
                self.touch_access(id).await?;
                return Ok(StoreOutcome::DuplicateOf(id.to_string()));
            }
        }

        let payload = serde_json::to_vec(content).unwrap_or_default();
        let content_hash = hex::encode(Sha256::digest(normalized_text(content).as_bytes()));
        if let Some(existing) = self.find_by_hash(&content_hash).await? {
            self.touch_access(&existing).await?;
            return Ok(StoreOutcome::DuplicateOf(existing));
        }

        if let Some(existing) = self.find_nearest(embedding).await? {
            if existing.distance < SIMILARITY_THRESHOLD {
                return Ok(StoreOutcome::DuplicateOf(existing.key));
            }
        }

        let id = memory_id
            .map(String::from)
            .unwrap_or_else(|| format!("mem-{}", uuid::Uuid::new_v4()));
        let key = self.memory_key(&id);
        let embedding_bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.broker
            .hset_all(
                &key,
                &[
                    ("memory_id", id.clone().into_bytes()),
                    ("memory_type", memory_type.as_bytes().to_vec()),
                    ("content", payload),
                    ("content_hash", content_hash.into_bytes()),
                    ("created_at", now_unix().to_string().into_bytes()),
                    ("access_count", b"0".to_vec()),
                    ("last_accessed", now_unix().to_string().into_bytes()),
                    ("embedding", embedding_bytes),
                ],
            )
            .await?;
        Ok(StoreOutcome::Inserted(id))
    }

    /// Bumps `access_count`/`last_accessed` on a dedup hit without
    /// disturbing the rest of the record.
    async fn touch_access(&self, memory_id: &str) -> Result<()> {
        let key = self.memory_key(memory_id);
        let count: u64 = self
            .broker
            .hget(&key, "access_count")
            .await?
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.broker
            .hset_all(
                &key,
                &[
                    ("access_count", (count + 1).to_string().into_bytes()),
                    ("last_accessed", now_unix().to_string().into_bytes()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let pattern = format!("{}memory:*", self.prefix);
        for key in self.broker.scan_keys(&pattern).await?.into_iter().take(self.max_scan) {
            if let Some(stored) = self.broker.hget(&key, "content_hash").await? {
                if stored == content_hash.as_bytes() {
                    return Ok(self
                        .broker
                        .hget(&key, "memory_id")
                        .await?
                        .and_then(|b| String::from_utf8(b).ok()));
                }
            }
        }
        Ok(None)
    }

    /// Public read-only nearest-neighbor lookup, for callers that want a
    /// similarity search without going through `store`'s dedup path.
    pub async fn search_nearest(&self, embedding: &[f32]) -> Result<Option<nexus_broker::VectorHit>> {
        self.find_nearest(embedding).await
    }

    async fn find_nearest(&self, embedding: &[f32]) -> Result<Option<nexus_broker::VectorHit>> {
        if self.vector_module_available.load(Ordering::SeqCst) {
            match self.broker.vector_search(INDEX_NAME, embedding, 1).await {
                Ok(hits) => return Ok(hits.into_iter().next()),
                Err(nexus_broker::BrokerError::Unavailable(_)) => {
                    self.vector_module_available.store(false, Ordering::SeqCst);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pattern = format!("{}memory:*", self.prefix);
        let keys = self.broker.scan_keys(&pattern).await?;
        let scanned = keys.len().min(self.max_scan);
        if keys.len() > self.max_scan {
            tracing::warn!(total = keys.len(), max_scan = self.max_scan, "truncating brute-force memory scan");
        }

        let mut best: Option<nexus_broker::VectorHit> = None;
        for key in keys.into_iter().take(scanned) {
            let Some(raw) = self.broker.hget(&key, "embedding").await? else {
                continue;
            };
            let candidate = bytes_to_f32(&raw);
            if candidate.len() != embedding.len() {
                continue;
            }
            let distance = cosine_distance(embedding, &candidate);
            if best.as_ref().map(|b| distance < b.distance).unwrap_or(true) {
                best = Some(nexus_broker::VectorHit {
                    key: key.clone(),
                    distance,
                });
            }
        }
        Ok(best)
    }

    pub async fn get_memory(&self, memory_id: &str) -> Result<Option<MemoryRecord>> {
        let key = self.memory_key(memory_id);
        let hash = self.broker.hgetall(&key).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(MemoryRecord {
            memory_id: memory_id.to_string(),
            memory_type: hash
                .get("memory_type")
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .unwrap_or_default(),
            content: hash
                .get("content")
                .and_then(|v| serde_json::from_slice(v).ok())
                .unwrap_or(serde_json::json!({})),
            content_hash: hash
                .get("content_hash")
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .unwrap_or_default(),
            created_at: hash
                .get("created_at")
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            access_count: hash
                .get("access_count")
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_accessed: hash
                .get("last_accessed")
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        }))
    }

    pub async fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        self.broker.del(&self.memory_key(memory_id)).await
    }

    pub async fn count_memories(&self) -> Result<u64> {
        let pattern = format!("{}memory:*", self.prefix);
        Ok(self.broker.scan_keys(&pattern).await?.len() as u64)
    }

    pub async fn get_memory_types(&self) -> Result<Vec<String>> {
        let pattern = format!("{}memory:*", self.prefix);
        let mut types = std::collections::HashSet::new();
        for key in self.broker.scan_keys(&pattern).await? {
            if let Some(t) = self.broker.hget(&key, "memory_type").await? {
                if let Ok(s) = String::from_utf8(t) {
                    types.insert(s);
                }
            }
        }
        Ok(types.into_iter().collect())
    }

    pub async fn get_recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let pattern = format!("{}memory:*", self.prefix);
        let mut records = Vec::new();
        for key in self.broker.scan_keys(&pattern).await? {
            let id = key.rsplit(':').next().unwrap_or_default().to_string();
            if let Some(record) = self.get_memory(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "vector_dims": self.vector_dims,
            "max_scan": self.max_scan,
            "vector_module_available": self.vector_module_available.load(Ordering::SeqCst),
        })
    }

    pub async fn get_index_info(&self) -> Result<serde_json::Value> {
        match self.broker.vector_index_info(INDEX_NAME).await? {
            Some((num_docs, num_records)) => Ok(serde_json::json!({
                "backend": "vector",
                "num_docs": num_docs,
                "num_records": num_records,
            })),
            None => Ok(serde_json::json!({ "backend": "brute-force" })),
        }
    }
}

/// Extracts the dedup-relevant text from a content payload and normalizes
/// it (stripped + lowercased) before hashing. Callers that store plain
/// prose under a `"text"` field get that field hashed directly; anything
/// else falls back to the normalized serialized JSON, which still makes
/// byte-identical-after-normalization payloads collide.
fn normalized_text(content: &serde_json::Value) -> String {
    match content.get("text").and_then(|v| v.as_str()) {
        Some(text) => text.trim().to_lowercase(),
        None => content.to_string().trim().to_lowercase(),
    }
}

fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_broker::MemoryBroker;

    fn embedding(seed: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[0] = seed;
        v
    }

    #[tokio::test]
    async fn stores_distinct_and_dedups_exact_content() {
        let broker = Arc::new(MemoryBroker::new());
        let index = MemoryIndex::new(broker, "test:".to_string(), 8);
        let content = serde_json::json!({"fact": "sky is blue"});

        let first = index.store(None, "fact", &content, &embedding(1.0)).await.unwrap();
        let StoreOutcome::Inserted(id) = first else {
            panic!("expected insert");
        };

        let second = index.store(None, "fact", &content, &embedding(2.0)).await.unwrap();
        assert_eq!(second, StoreOutcome::DuplicateOf(id));
    }

    #[tokio::test]
    async fn rejects_wrong_dimension() {
        let broker = Arc::new(MemoryBroker::new());
        let index = MemoryIndex::new(broker, "test:".to_string(), 8);
        let result = index
            .store(None, "fact", &serde_json::json!({}), &[0.0, 1.0])
            .await;
        assert!(matches!(result, Err(ClusterError::DimensionMismatch { .. })));
    }
}
