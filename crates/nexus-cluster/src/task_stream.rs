//! Durable priority task queue over broker streams, with consumer-group
//! claiming, retry, and dead-lettering.
//! Grounded on `examples/original_source/backend/core/cluster/task_stream.py`.

use crate::error::{ClusterError, Result};
use crate::metrics::Metrics;
use nexus_broker::{Broker, StreamEntry, StreamStart};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

const MAX_RETRIES: u32 = 3;
const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CLAIM_LOOP_PERIOD_SECS: u64 = 30;
const GROUP_NAME: &str = "nexus-workers";

/// Task priority, mapped to one of three backing streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    fn suffix(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Terminal status of a processed task, as observed through
/// [`TaskStream::await_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    Completed,
    Failed,
}

/// The envelope written to `{prefix}result:{task_id}` once a task reaches
/// a terminal state (success, or dead-letter after exhausting retries).
/// An ordinary retryable failure writes nothing here, so a waiting
/// `await_result` keeps polling until the retry either succeeds or is
/// dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    pub attempt: u32,
}

pub type TaskHandler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = std::result::Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Durable task queue: publish/claim/retry/dead-letter over three
/// priority streams, sharing one consumer group per stream.
pub struct TaskStream<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    consumer_id: String,
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    stopped: Arc<AtomicBool>,
    worker_task: RwLock<Option<JoinHandle<()>>>,
    claim_task: RwLock<Option<JoinHandle<()>>>,
    claim_loop_enabled: AtomicBool,
    claim_timeout_ms: u64,
    claim_loop_period_secs: u64,
    stats: Arc<TaskStats>,
    metrics: Arc<Metrics>,
}

struct TaskStats {
    published: AtomicI64,
    processed: AtomicI64,
    failed: AtomicI64,
    dead_lettered: AtomicI64,
    reclaimed: AtomicI64,
}

impl<B: Broker + 'static> TaskStream<B> {
    pub fn new(broker: Arc<B>, prefix: String, consumer_id: String, metrics: Arc<Metrics>) -> Self {
        Self {
            broker,
            prefix,
            consumer_id,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            worker_task: RwLock::new(None),
            claim_task: RwLock::new(None),
            claim_loop_enabled: AtomicBool::new(true),
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            claim_loop_period_secs: DEFAULT_CLAIM_LOOP_PERIOD_SECS,
            stats: Arc::new(TaskStats {
                published: AtomicI64::new(0),
                processed: AtomicI64::new(0),
                failed: AtomicI64::new(0),
                dead_lettered: AtomicI64::new(0),
                reclaimed: AtomicI64::new(0),
            }),
            metrics,
        }
    }

    /// Overrides the abandoned-task reclaim timing, for tests driving a
    /// real claim loop end-to-end without waiting on the 60s/30s
    /// production defaults.
    pub fn with_claim_timing(mut self, claim_timeout_ms: u64, claim_loop_period_secs: u64) -> Self {
        self.claim_timeout_ms = claim_timeout_ms;
        self.claim_loop_period_secs = claim_loop_period_secs;
        self
    }

    fn stream_key(&self, priority: Priority) -> String {
        format!("{}tasks:{}", self.prefix, priority.suffix())
    }

    fn dead_letter_key(&self) -> String {
        format!("{}tasks:dead", self.prefix)
    }

    pub fn register_handler(&self, task_type: &str, handler: TaskHandler) {
        self.handlers.write().insert(task_type.to_string(), handler);
    }

    pub async fn publish(
        &self,
        priority: Priority,
        task_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let stream = self.stream_key(priority);
        let task_id = uuid::Uuid::new_v4().to_string();
        let fields = vec![
            ("task_id", task_id.clone().into_bytes()),
            ("task_type", task_type.as_bytes().to_vec()),
            ("payload", serde_json::to_vec(payload).unwrap_or_default()),
        ];
        self.broker.xadd(&stream, &fields).await?;
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_task_published();
        Ok(task_id)
    }

    pub async fn ensure_groups(&self) -> Result<()> {
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            self.broker
                .xgroup_create(&self.stream_key(priority), GROUP_NAME, StreamStart::NewOnly)
                .await?;
        }
        Ok(())
    }

    /// Reads from high, then normal, then low (priority-ordered polling),
    /// dispatches to the registered handler, acks on success, and
    /// dead-letters after `MAX_RETRIES`.
    pub fn start_worker_loop(&self) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let consumer_id = self.consumer_id.clone();
        let prefix = self.prefix.clone();
        let stopped = self.stopped.clone();
        let handlers = self.handlers.clone();
        let dead_letter_key = self.dead_letter_key();
        let stats = self.stats.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let streams = [
                format!("{prefix}tasks:high"),
                format!("{prefix}tasks:normal"),
                format!("{prefix}tasks:low"),
            ];
            let stream_refs: Vec<&str> = streams.iter().map(|s| s.as_str()).collect();
            while !stopped.load(Ordering::SeqCst) {
                let entries = match broker
                    .xreadgroup(GROUP_NAME, &consumer_id, &stream_refs, 10, 2000)
                    .await
                {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "xreadgroup failed");
                        continue;
                    }
                };
                for (stream, entry) in entries {
                    process_entry(&broker, &stream, &entry, &handlers, &dead_letter_key, &prefix, &consumer_id, &stats, &metrics)
                        .await;
                }
            }
        })
    }

    /// Reclaims entries idle longer than `claim_timeout_ms` and dispatches
    /// them straight into [`process_entry`]; disables itself if the broker
    /// reports no auto-claim support.
    pub fn start_claim_loop(&self) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let consumer_id = self.consumer_id.clone();
        let prefix = self.prefix.clone();
        let stopped = self.stopped.clone();
        let handlers = self.handlers.clone();
        let dead_letter_key = self.dead_letter_key();
        let stats = self.stats.clone();
        let metrics = self.metrics.clone();
        let claim_timeout_ms = self.claim_timeout_ms;
        let claim_loop_period_secs = self.claim_loop_period_secs;

        tokio::spawn(async move {
            let streams = [
                format!("{prefix}tasks:high"),
                format!("{prefix}tasks:normal"),
                format!("{prefix}tasks:low"),
            ];
            while !stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(claim_loop_period_secs)).await;
                for stream in &streams {
                    match broker
                        .xautoclaim(stream, GROUP_NAME, &consumer_id, claim_timeout_ms, 10)
                        .await
                    {
                        Ok(Some(entries)) if !entries.is_empty() => {
                            tracing::info!(stream, count = entries.len(), "reclaimed abandoned tasks");
                            for entry in entries {
                                stats.reclaimed.fetch_add(1, Ordering::SeqCst);
                                process_entry(
                                    &broker,
                                    stream,
                                    &entry,
                                    &handlers,
                                    &dead_letter_key,
                                    &prefix,
                                    &consumer_id,
                                    &stats,
                                    &metrics,
                                )
                                .await;
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            tracing::warn!("broker has no XAUTOCLAIM support, disabling claim loop");
                            return;
                        }
                        Err(e) => tracing::warn!(stream, error = %e, "xautoclaim failed"),
                    }
                }
            }
        })
    }

    pub fn set_worker_task(&self, handle: JoinHandle<()>) {
        *self.worker_task.write() = Some(handle);
    }

    pub fn set_claim_task(&self, handle: JoinHandle<()>) {
        *self.claim_task.write() = Some(handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(t) = self.worker_task.write().take() {
            t.abort();
        }
        if let Some(t) = self.claim_task.write().take() {
            t.abort();
        }
    }

    pub async fn await_result(&self, task_id: &str, timeout_secs: u64) -> Result<Option<TaskResult>> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);
        let key = result_key(&self.prefix, task_id);
        loop {
            if let Some(bytes) = self.broker.get(&key).await? {
                if let Ok(result) = serde_json::from_slice::<TaskResult>(&bytes) {
                    if matches!(result.status, TaskResultStatus::Completed | TaskResultStatus::Failed) {
                        return Ok(Some(result));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    pub async fn await_results(
        &self,
        task_ids: &[String],
        timeout_secs: u64,
    ) -> Result<HashMap<String, Option<TaskResult>>> {
        let mut out = HashMap::new();
        for id in task_ids {
            out.insert(id.clone(), self.await_result(id, timeout_secs).await?);
        }
        Ok(out)
    }

    pub async fn get_stream_info(&self, priority: Priority) -> Result<serde_json::Value> {
        let stream = self.stream_key(priority);
        let len = self.broker.xlen(&stream).await?;
        let pending = self.broker.xpending_count(&stream, GROUP_NAME).await?;
        Ok(serde_json::json!({ "length": len, "pending": pending }))
    }

    pub async fn get_dead_letters(&self, count: usize) -> Result<Vec<StreamEntry>> {
        self.broker.xrevrange(&self.dead_letter_key(), count).await
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "published": self.stats.published.load(Ordering::SeqCst),
            "processed": self.stats.processed.load(Ordering::SeqCst),
            "failed": self.stats.failed.load(Ordering::SeqCst),
            "dead_lettered": self.stats.dead_lettered.load(Ordering::SeqCst),
            "reclaimed": self.stats.reclaimed.load(Ordering::SeqCst),
            "claim_loop_enabled": self.claim_loop_enabled.load(Ordering::SeqCst),
        })
    }
}

/// Key under which a task's terminal result is published.
fn result_key(prefix: &str, task_id: &str) -> String {
    format!("{prefix}result:{task_id}")
}

/// Key backing the durable per-task attempt counter. Stream entries are
/// immutable once written (no in-place field rewrite on redelivery), so
/// the attempt count lives here instead of on the entry.
fn attempt_key(prefix: &str, task_id: &str) -> String {
    format!("{prefix}tasks:attempt:{task_id}")
}

#[allow(clippy::too_many_arguments)]
async fn process_entry<B: Broker>(
    broker: &Arc<B>,
    stream: &str,
    entry: &StreamEntry,
    handlers: &Arc<RwLock<HashMap<String, TaskHandler>>>,
    dead_letter_key: &str,
    prefix: &str,
    agent_id: &str,
    stats: &Arc<TaskStats>,
    metrics: &Arc<Metrics>,
) {
    let task_type = field_str(entry, "task_type");
    let task_id = field_str(entry, "task_id");
    let payload: serde_json::Value = entry
        .fields
        .get("payload")
        .and_then(|v| serde_json::from_slice(v).ok())
        .unwrap_or(serde_json::json!({}));

    let attempt = broker.incr(&attempt_key(prefix, &task_id)).await.unwrap_or(1) as u32;

    let handler = handlers.read().get(&task_type).cloned();
    let outcome = match handler {
        Some(h) => h(payload).await,
        None => Err(format!("no handler for task type {task_type:?}")),
    };

    match outcome {
        Ok(result) => {
            let envelope = TaskResult {
                status: TaskResultStatus::Completed,
                result: Some(result),
                error: None,
                agent_id: agent_id.to_string(),
                completed_at: Some(nexus_types::now_unix()),
                failed_at: None,
                attempt,
            };
            let _ = broker
                .set(
                    &result_key(prefix, &task_id),
                    &serde_json::to_vec(&envelope).unwrap_or_default(),
                    nexus_broker::SetOptions::ex(3600),
                )
                .await;
            let _ = broker.xack(stream, GROUP_NAME, &entry.id).await;
            stats.processed.fetch_add(1, Ordering::SeqCst);
            metrics.record_task_processed();
        }
        Err(error) => {
            if attempt >= MAX_RETRIES {
                let mut fields: Vec<(&str, Vec<u8>)> = entry
                    .fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.clone()))
                    .collect();
                fields.push(("error", error.clone().into_bytes()));
                fields.push(("attempts", attempt.to_string().into_bytes()));
                let _ = broker.xadd(dead_letter_key, &fields).await;

                let envelope = TaskResult {
                    status: TaskResultStatus::Failed,
                    result: None,
                    error: Some(error.clone()),
                    agent_id: agent_id.to_string(),
                    completed_at: None,
                    failed_at: Some(nexus_types::now_unix()),
                    attempt,
                };
                let _ = broker
                    .set(
                        &result_key(prefix, &task_id),
                        &serde_json::to_vec(&envelope).unwrap_or_default(),
                        nexus_broker::SetOptions::ex(3600),
                    )
                    .await;
                let _ = broker.xack(stream, GROUP_NAME, &entry.id).await;
                stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
                stats.failed.fetch_add(1, Ordering::SeqCst);
                metrics.record_task_failed();
            } else {
                tracing::warn!(task_id, task_type, attempt, error, "task failed, will retry");
                // Do not ack: the entry stays in the pending-entries list
                // and is picked up by XAUTOCLAIM once idle past the claim
                // timeout. No result is written, so `await_result` keeps
                // polling through the retry.
            }
        }
    }
}

fn field_str(entry: &StreamEntry, field: &str) -> String {
    entry
        .fields
        .get(field)
        .and_then(|v| String::from_utf8(v.clone()).ok())
        .unwrap_or_default()
}

impl From<ClusterError> for String {
    fn from(e: ClusterError) -> Self {
        e.to_string()
    }
}
