//! Ephemeral session/context/claim store with a debounced promotion queue.
//! Grounded on `examples/original_source/backend/core/cluster/working_memory.py`.

use crate::error::Result;
use nexus_broker::Broker;
use nexus_types::now_unix;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type PromotionCallback =
    Arc<dyn Fn(String, serde_json::Value) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// One agent's claim on a conversation's in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkClaim {
    pub conv_id: String,
    pub task_type: String,
    pub started_at: i64,
    pub agent_id: String,
}

/// Session/context/claim store backed by hashes + a promotion sorted set.
pub struct WorkingMemory<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    session_ttl_secs: u64,
    context_ttl_secs: u64,
    work_ttl_secs: u64,
    promotion_delay_secs: u64,

    promotion_callback: RwLock<Option<PromotionCallback>>,
    seen_hashes: RwLock<HashSet<String>>,
    stopped: Arc<AtomicBool>,
    promotion_task: RwLock<Option<JoinHandle<()>>>,
}

impl<B: Broker + 'static> WorkingMemory<B> {
    pub fn new(broker: Arc<B>, prefix: String, session_ttl_secs: u64, promotion_delay_secs: u64) -> Self {
        Self {
            broker,
            prefix,
            session_ttl_secs,
            context_ttl_secs: session_ttl_secs * 2,
            work_ttl_secs: 1800,
            promotion_delay_secs,
            promotion_callback: RwLock::new(None),
            seen_hashes: RwLock::new(HashSet::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            promotion_task: RwLock::new(None),
        }
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}session:{}", self.prefix, session_id)
    }
    fn context_key(&self, conversation_id: &str) -> String {
        format!("{}context:{}", self.prefix, conversation_id)
    }
    fn agent_work_key(&self, agent_id: &str) -> String {
        format!("{}agent_work:{}", self.prefix, agent_id)
    }
    fn sessions_index_key(&self) -> String {
        format!("{}sessions:index", self.prefix)
    }
    fn promotion_queue_key(&self) -> String {
        format!("{}promotion:queue", self.prefix)
    }

    pub async fn set_session(&self, session_id: &str, data: &serde_json::Value) -> Result<()> {
        let key = self.session_key(session_id);
        let payload = serde_json::to_vec(data).unwrap_or_default();
        self.broker.hset(&key, "data", &payload).await?;
        self.broker
            .hset(&key, "updated_at", now_unix().to_string().as_bytes())
            .await?;
        self.broker.expire(&key, self.session_ttl_secs).await?;
        self.broker
            .zadd(&self.sessions_index_key(), session_id, now_unix() as f64)
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let raw = self.broker.hget(&self.session_key(session_id), "data").await?;
        Ok(raw.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    /// Patches an existing session's data. Returns `false` without
    /// writing if the session key does not exist (no upsert).
    pub async fn update_session(&self, session_id: &str, patch: &serde_json::Value) -> Result<bool> {
        let Some(mut current) = self.get_session(session_id).await? else {
            return Ok(false);
        };
        merge_json(&mut current, patch);
        self.set_session(session_id, &current).await?;
        Ok(true)
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        let key = self.session_key(session_id);
        self.broker.expire(&key, self.session_ttl_secs).await?;
        self.broker
            .zadd(&self.sessions_index_key(), session_id, now_unix() as f64)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.broker.del(&self.session_key(session_id)).await?;
        self.broker.zrem(&self.sessions_index_key(), session_id).await?;
        Ok(())
    }

    pub async fn get_active_sessions(&self) -> Result<Vec<String>> {
        self.broker.zrange(&self.sessions_index_key(), 0, -1).await
    }

    pub async fn count_active_sessions(&self) -> Result<u64> {
        self.broker.zcard(&self.sessions_index_key()).await
    }

    /// Scans every agent's work-claim hash for one claiming `conv_id`.
    pub async fn find_agent_for_conversation(&self, conv_id: &str) -> Result<Option<String>> {
        let pattern = format!("{}agent_work:*", self.prefix);
        for key in self.broker.scan_keys(&pattern).await? {
            if let Some(raw) = self.broker.hget(&key, conv_id).await? {
                if let Ok(claim) = serde_json::from_slice::<WorkClaim>(&raw) {
                    return Ok(Some(claim.agent_id));
                }
            }
        }
        Ok(None)
    }

    pub async fn cleanup_stale_sessions(&self) -> Result<u64> {
        let cutoff = (now_unix() - self.session_ttl_secs as i64) as f64;
        let stale = self.broker.zrangebyscore_lt(&self.sessions_index_key(), cutoff).await?;
        for session_id in &stale {
            self.delete_session(session_id).await?;
        }
        Ok(stale.len() as u64)
    }

    pub async fn set_context(&self, conversation_id: &str, data: &serde_json::Value) -> Result<()> {
        let key = self.context_key(conversation_id);
        let payload = serde_json::to_vec(data).unwrap_or_default();
        self.broker.hset(&key, "data", &payload).await?;
        self.broker.expire(&key, self.context_ttl_secs).await?;
        Ok(())
    }

    pub async fn get_context(&self, conversation_id: &str) -> Result<Option<serde_json::Value>> {
        let raw = self.broker.hget(&self.context_key(conversation_id), "data").await?;
        Ok(raw.and_then(|b| serde_json::from_slice(&b).ok()))
    }

    /// Claims `conv_id` for `agent_id` if no agent already holds it.
    /// Stores the claim as a field in `agent_id`'s own work hash, keyed by
    /// `conv_id`, so [`Self::get_agent_work`] can list one agent's claims
    /// directly instead of scanning every conversation.
    pub async fn claim_work(&self, agent_id: &str, conv_id: &str, task_type: &str) -> Result<bool> {
        if self.find_agent_for_conversation(conv_id).await?.is_some() {
            return Ok(false);
        }
        let claim = WorkClaim {
            conv_id: conv_id.to_string(),
            task_type: task_type.to_string(),
            started_at: now_unix(),
            agent_id: agent_id.to_string(),
        };
        let key = self.agent_work_key(agent_id);
        self.broker
            .hset(&key, conv_id, &serde_json::to_vec(&claim).unwrap_or_default())
            .await?;
        self.broker.expire(&key, self.work_ttl_secs).await?;
        Ok(true)
    }

    pub async fn release_work(&self, agent_id: &str, conv_id: &str) -> Result<bool> {
        self.broker.hdel(&self.agent_work_key(agent_id), conv_id).await
    }

    /// Lists every conversation currently claimed by `agent_id`.
    pub async fn get_agent_work(&self, agent_id: &str) -> Result<Vec<WorkClaim>> {
        let hash = self.broker.hgetall(&self.agent_work_key(agent_id)).await?;
        Ok(hash
            .values()
            .filter_map(|raw| serde_json::from_slice(raw).ok())
            .collect())
    }

    pub fn set_promotion_callback(&self, callback: PromotionCallback) {
        *self.promotion_callback.write() = Some(callback);
    }

    /// Enqueues a memory candidate for promotion, deduplicated by content
    /// hash within this process's lifetime and debounced by
    /// `promotion_delay_secs` via the sorted-set score.
    pub async fn queue_for_promotion(&self, memory_id: &str, content: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_vec(content).unwrap_or_default();
        let hash = hex::encode(Sha256::digest(&payload));
        if !self.seen_hashes.write().insert(hash) {
            return Ok(());
        }
        let promote_at = (now_unix() + self.promotion_delay_secs as i64) as f64;
        self.broker
            .zadd(&self.promotion_queue_key(), memory_id, promote_at)
            .await?;
        self.broker
            .hset(&format!("{}promotion:payload:{}", self.prefix, memory_id), "data", &payload)
            .await?;
        Ok(())
    }

    pub fn start_promotion_loop(&self) -> JoinHandle<()>
    where
        B: 'static,
    {
        let broker = self.broker.clone();
        let prefix = self.prefix.clone();
        let stopped = self.stopped.clone();
        let callback = self.promotion_callback.read().clone();

        tokio::spawn(async move {
            let queue_key = format!("{prefix}promotion:queue");
            while !stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                let now = now_unix() as f64;
                let due = match broker.zrangebyscore_lt(&queue_key, now).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "promotion queue scan failed");
                        continue;
                    }
                };
                for memory_id in due {
                    let payload_key = format!("{prefix}promotion:payload:{memory_id}");
                    let data = match broker.hget(&payload_key, "data").await {
                        Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({})),
                        _ => serde_json::json!({}),
                    };
                    if let Some(cb) = &callback {
                        cb(memory_id.clone(), data).await;
                    }
                    let _ = broker.zrem(&queue_key, &memory_id).await;
                    let _ = broker.del(&payload_key).await;
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.promotion_task.write().take() {
            task.abort();
        }
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "session_ttl_secs": self.session_ttl_secs,
            "promotion_delay_secs": self.promotion_delay_secs,
            "seen_hashes": self.seen_hashes.read().len(),
        })
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
}
