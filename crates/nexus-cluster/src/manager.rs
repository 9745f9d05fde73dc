//! Config-driven supervisor: constructs every component in dependency
//! order, late-binds the health→election callback, and starts/stops
//! subsystems in forward/reverse order.
//! Grounded on `guts-node::Node`'s construct/start/stop lifecycle and
//! `examples/original_source/backend/core/cluster/manager.py`.

use crate::config::ClusterConfig;
use crate::election::ElectionManager;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::health::HealthMonitor;
use crate::memory_index::MemoryIndex;
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;
use crate::registry::AgentRegistry;
use crate::task_stream::TaskStream;
use crate::working_memory::WorkingMemory;
use nexus_broker::Broker;
use nexus_types::{AgentRecord, Role};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;

const METRICS_COLLECT_PERIOD_SECS: u64 = 10;

/// Owns every clustering subsystem for one agent process.
///
/// Dependency order mirrors spec.md §2 (leaves first): registry, then
/// event bus / rate limiter / working memory / memory index / task
/// stream, then health monitor, then election (which needs the
/// registry and is wired into health's ODOWN callback after both
/// exist).
pub struct ClusterManager<B: Broker> {
    enabled: bool,
    pub registry: Arc<AgentRegistry<B>>,
    pub event_bus: Arc<EventBus<B>>,
    pub rate_limiter: Arc<RateLimiter<B>>,
    pub working_memory: Arc<WorkingMemory<B>>,
    pub memory_index: Arc<MemoryIndex<B>>,
    pub task_stream: Arc<TaskStream<B>>,
    pub health: Arc<HealthMonitor<B>>,
    pub election: Arc<ElectionManager<B>>,
    pub metrics: Arc<Metrics>,
    rate_limit_window_secs: u64,
    metrics_task: RwLock<Option<JoinHandle<()>>>,
}

impl<B: Broker + 'static> ClusterManager<B> {
    pub fn new(broker: Arc<B>, config: &ClusterConfig) -> Self {
        let prefix = config.broker.key_prefix.clone();
        let agent_id = if config.agent.agent_id.is_empty() {
            nexus_types::generate_agent_id()
        } else {
            config.agent.agent_id.clone()
        };
        let role = match config.agent.role.to_lowercase().as_str() {
            "primary" => Role::Primary,
            "secondary" => Role::Secondary,
            _ => Role::Auto,
        };

        let registry = Arc::new(AgentRegistry::new(
            broker.clone(),
            prefix.clone(),
            Some(agent_id.clone()),
            role,
            config.agent.max_load,
            config.agent.heartbeat_interval_secs,
            config.agent.failure_threshold,
        ));

        let metrics = Arc::new(Metrics::new());
        let event_bus = Arc::new(EventBus::new(broker.clone(), prefix.clone(), agent_id.clone(), metrics.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(broker.clone(), prefix.clone()));
        let working_memory = Arc::new(WorkingMemory::new(
            broker.clone(),
            prefix.clone(),
            config.working_memory.session_ttl_secs,
            config.working_memory.promotion_delay_secs,
        ));
        let memory_index = Arc::new(MemoryIndex::new(broker.clone(), prefix.clone(), config.memory_index.vector_dims));
        let task_stream = Arc::new(TaskStream::new(broker.clone(), prefix.clone(), agent_id.clone(), metrics.clone()));
        let health = Arc::new(HealthMonitor::new(
            broker.clone(),
            registry.clone(),
            prefix.clone(),
            agent_id.clone(),
            event_bus.clone(),
        ));
        let election = Arc::new(ElectionManager::new(
            broker.clone(),
            registry.clone(),
            working_memory.clone(),
            event_bus.clone(),
            prefix.clone(),
            agent_id.clone(),
            config.election.clone(),
        ));

        // Late-bind the cyclic reference: health confirms ODOWN, election
        // reacts by trying to become primary.
        let election_for_callback = election.clone();
        health.set_odown_callback(Arc::new(move |agent_id: String| {
            let election = election_for_callback.clone();
            tokio::spawn(async move {
                match election.trigger_election().await {
                    Ok(Some(winner)) => {
                        tracing::info!(failed_agent = %agent_id, winner, "election completed after ODOWN");
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(failed_agent = %agent_id, error = %e, "election failed"),
                }
            });
        }));

        Self {
            enabled: config.enabled,
            registry,
            event_bus,
            rate_limiter,
            working_memory,
            memory_index,
            task_stream,
            health,
            election,
            metrics,
            rate_limit_window_secs: config.rate_limit.window_secs,
            metrics_task: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts subsystems in forward dependency order. A no-op if clustering
    /// is disabled (spec.md §4.10).
    pub async fn start(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.registry.start().await?;
        self.event_bus.start().await?;
        self.task_stream.ensure_groups().await?;
        self.memory_index.ensure_index().await?;

        let worker = self.task_stream.start_worker_loop();
        self.task_stream.set_worker_task(worker);
        let claim = self.task_stream.start_claim_loop();
        self.task_stream.set_claim_task(claim);

        let monitor = self.health.start();
        self.health.set_monitor_task(monitor);

        let promotion = self.working_memory.start_promotion_loop();
        let _ = promotion;

        *self.metrics_task.write() = Some(self.spawn_metrics_loop());

        tracing::info!(agent_id = %self.registry.agent_id(), "cluster manager started");
        Ok(())
    }

    fn spawn_metrics_loop(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let working_memory = self.working_memory.clone();
        let memory_index = self.memory_index.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(METRICS_COLLECT_PERIOD_SECS)).await;
                metrics.set_is_primary(registry.role() == Role::Primary);
                if let Ok(count) = working_memory.count_active_sessions().await {
                    metrics.set_active_sessions(count as i64);
                }
                if let Ok(count) = memory_index.count_memories().await {
                    metrics.set_memories_stored(count as i64);
                }
                metrics.collect();
            }
        })
    }

    /// Stops subsystems in reverse order, then deregisters this agent.
    pub async fn stop(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(t) = self.metrics_task.write().take() {
            t.abort();
        }
        self.working_memory.stop();
        self.health.stop();
        self.task_stream.stop();
        self.event_bus.stop().await?;
        self.registry.stop().await?;
        Ok(())
    }

    pub fn is_primary(&self) -> bool {
        self.enabled && self.registry.role() == Role::Primary
    }

    pub fn is_active(&self) -> bool {
        !self.enabled || self.registry.status() == nexus_types::AgentStatus::Active
    }

    pub async fn get_agents(&self) -> Result<Vec<AgentRecord>> {
        self.registry.get_all_agents().await
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "agent_id": self.registry.agent_id(),
            "role": self.registry.role().to_string(),
            "status": self.registry.status().to_string(),
            "election": self.election.get_status(),
        })
    }

    // -- convenience passthroughs, mirroring spec.md §4.10 -------------

    pub async fn publish_agent_event(&self, event_type: &str, data: serde_json::Value) -> Result<i64> {
        self.event_bus.publish_agent_event(event_type, data).await
    }

    pub async fn check_rate_limit(&self, resource: &str, limit: u64) -> crate::rate_limiter::RateLimitDecision {
        if !self.enabled {
            return crate::rate_limiter::RateLimitDecision {
                allowed: true,
                weighted_count: 0.0,
                limit,
                retry_after_secs: 0,
            };
        }
        self.rate_limiter.check(resource, limit, self.rate_limit_window_secs, 1).await
    }

    pub async fn claim_work(&self, conv_id: &str, task_type: &str) -> Result<bool> {
        self.working_memory.claim_work(self.registry.agent_id(), conv_id, task_type).await
    }

    pub async fn store_session(&self, session_id: &str, data: &serde_json::Value) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.working_memory.set_session(session_id, data).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        if !self.enabled {
            return Ok(None);
        }
        self.working_memory.get_session(session_id).await
    }

    pub async fn store_memory(
        &self,
        memory_type: &str,
        content: &serde_json::Value,
        embedding: &[f32],
    ) -> Result<Option<crate::memory_index::StoreOutcome>> {
        if !self.enabled {
            return Ok(None);
        }
        Ok(Some(self.memory_index.store(None, memory_type, content, embedding).await?))
    }

    pub async fn search_memory(&self, embedding: &[f32]) -> Result<Option<nexus_broker::VectorHit>> {
        if !self.enabled {
            return Ok(None);
        }
        self.memory_index.search_nearest(embedding).await
    }
}
