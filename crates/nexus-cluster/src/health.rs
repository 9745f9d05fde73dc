//! Two-phase distributed failure detection: SDOWN (subjective, one
//! agent's opinion) escalating to ODOWN (quorum-confirmed), which
//! triggers failover. Grounded on
//! `examples/original_source/backend/core/cluster/health.py`.

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::registry::AgentRegistry;
use nexus_broker::Broker;
use nexus_types::{now_unix, AgentStatus};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Vote TTLs: an SDOWN opinion expires after 30s if not refreshed, an
/// ODOWN confirmation after 60s.
const SDOWN_VOTE_TTL_SECS: u64 = 30;
const ODOWN_VOTE_TTL_SECS: u64 = 60;
const MONITOR_PERIOD_SECS: u64 = 2;

/// Callback invoked once an agent is confirmed ODOWN; wired to
/// `ElectionManager::trigger_election` by `ClusterManager`.
pub type OdownCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    Healthy,
    Sdown,
    Odown,
}

struct VoteState {
    sdown_voters: HashSet<String>,
    odown_confirmed: bool,
}

/// Monitors peer heartbeats, casts SDOWN opinions, tallies quorum votes
/// from other agents, and escalates to ODOWN + failover callback.
pub struct HealthMonitor<B: Broker> {
    broker: Arc<B>,
    registry: Arc<AgentRegistry<B>>,
    prefix: String,
    self_id: String,
    event_bus: Arc<EventBus<B>>,

    votes: RwLock<HashMap<String, VoteState>>,
    odown_callback: RwLock<Option<OdownCallback>>,
    stopped: Arc<AtomicBool>,
    monitor_task: RwLock<Option<JoinHandle<()>>>,
    /// Last quorum computed by [`Self::compute_quorum`]; -1 means "never
    /// computed" / "active_agents < 2" (no quorum possible yet).
    last_quorum: AtomicI64,
}

impl<B: Broker + 'static> HealthMonitor<B> {
    pub fn new(
        broker: Arc<B>,
        registry: Arc<AgentRegistry<B>>,
        prefix: String,
        self_id: String,
        event_bus: Arc<EventBus<B>>,
    ) -> Self {
        Self {
            broker,
            registry,
            prefix,
            self_id,
            event_bus,
            votes: RwLock::new(HashMap::new()),
            odown_callback: RwLock::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            monitor_task: RwLock::new(None),
            last_quorum: AtomicI64::new(-1),
        }
    }

    pub fn set_odown_callback(&self, callback: OdownCallback) {
        *self.odown_callback.write() = Some(callback);
    }

    fn vote_key(&self, agent_id: &str) -> String {
        format!("{}health:sdown:{}", self.prefix, agent_id)
    }

    fn odown_key(&self, agent_id: &str) -> String {
        format!("{}health:odown:{}", self.prefix, agent_id)
    }

    /// `floor(active_agents/2)+1`, where `active_agents` excludes agents
    /// whose status is `stopped`. Returns `None` when fewer than two
    /// agents are active — a lone agent is always primary and ODOWN can
    /// never be confirmed against it, since there is no one to form a
    /// quorum with.
    pub async fn compute_quorum(&self) -> Result<Option<usize>> {
        let peers = self.registry.get_all_agents().await?;
        let active_agents = peers.iter().filter(|a| a.status != AgentStatus::Stopped).count();
        if active_agents < 2 {
            self.last_quorum.store(-1, Ordering::SeqCst);
            return Ok(None);
        }
        let quorum = active_agents / 2 + 1;
        self.last_quorum.store(quorum as i64, Ordering::SeqCst);
        Ok(Some(quorum))
    }

    /// Single monitoring pass: scans peers, marks/clears SDOWN locally,
    /// publishes this agent's opinion, and tallies votes cast by others.
    pub async fn check_once(&self) -> Result<()> {
        let peers = self.registry.get_all_agents().await?;
        for peer in &peers {
            if peer.is_self {
                continue;
            }
            if peer.healthy {
                self.clear_sdown(&peer.id).await?;
            } else {
                self.mark_sdown(&peer.id).await?;
            }
        }
        Ok(())
    }

    async fn mark_sdown(&self, agent_id: &str) -> Result<()> {
        let was_sdown = self
            .votes
            .read()
            .get(agent_id)
            .map(|s| !s.sdown_voters.is_empty())
            .unwrap_or(false);

        let key = self.vote_key(agent_id);
        self.broker
            .hset(&key, &self.self_id, now_unix().to_string().as_bytes())
            .await?;
        self.broker.expire(&key, SDOWN_VOTE_TTL_SECS).await?;

        let votes = self.broker.hgetall(&key).await?;
        self.votes
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| VoteState {
                sdown_voters: HashSet::new(),
                odown_confirmed: false,
            })
            .sdown_voters = votes.keys().cloned().collect();

        if !was_sdown {
            let _ = self
                .event_bus
                .publish_health_event("agent_sdown", serde_json::json!({ "agent_id": agent_id }))
                .await;
        }

        let quorum = self.compute_quorum().await?;
        if let Some(quorum) = quorum {
            if votes.len() >= quorum {
                self.confirm_odown(agent_id).await?;
            }
        }
        Ok(())
    }

    async fn clear_sdown(&self, agent_id: &str) -> Result<()> {
        let was_unhealthy = self
            .votes
            .read()
            .get(agent_id)
            .map(|s| s.odown_confirmed || !s.sdown_voters.is_empty())
            .unwrap_or(false);

        let key = self.vote_key(agent_id);
        self.broker.hdel(&key, &self.self_id).await?;
        if let Some(state) = self.votes.write().get_mut(agent_id) {
            state.sdown_voters.remove(&self.self_id);
        }
        self.broker.del(&self.odown_key(agent_id)).await?;
        if let Some(state) = self.votes.write().get_mut(agent_id) {
            state.odown_confirmed = false;
        }

        if was_unhealthy {
            let _ = self
                .event_bus
                .publish_health_event("agent_recovered", serde_json::json!({ "agent_id": agent_id }))
                .await;
        }
        Ok(())
    }

    async fn confirm_odown(&self, agent_id: &str) -> Result<()> {
        let already = self
            .votes
            .read()
            .get(agent_id)
            .map(|s| s.odown_confirmed)
            .unwrap_or(false);
        if already {
            return Ok(());
        }
        self.broker
            .set(
                &self.odown_key(agent_id),
                self.self_id.as_bytes(),
                nexus_broker::SetOptions::ex(ODOWN_VOTE_TTL_SECS),
            )
            .await?;
        if let Some(state) = self.votes.write().get_mut(agent_id) {
            state.odown_confirmed = true;
        }
        tracing::warn!(agent_id, "agent confirmed ODOWN by quorum");
        let _ = self
            .event_bus
            .publish_health_event("agent_odown", serde_json::json!({ "agent_id": agent_id }))
            .await;
        if let Some(cb) = self.odown_callback.read().as_ref() {
            cb(agent_id.to_string());
        }
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while !this.stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(MONITOR_PERIOD_SECS)).await;
                if let Err(e) = this.check_once().await {
                    tracing::warn!(error = %e, "health check pass failed");
                }
            }
        })
    }

    pub fn set_monitor_task(&self, handle: JoinHandle<()>) {
        *self.monitor_task.write() = Some(handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(t) = self.monitor_task.write().take() {
            t.abort();
        }
    }

    pub fn get_status(&self, agent_id: &str) -> FailureState {
        match self.votes.read().get(agent_id) {
            Some(s) if s.odown_confirmed => FailureState::Odown,
            Some(s) if !s.sdown_voters.is_empty() => FailureState::Sdown,
            _ => FailureState::Healthy,
        }
    }

    pub fn get_vote_status(&self, agent_id: &str) -> serde_json::Value {
        let quorum = self.last_quorum.load(Ordering::SeqCst);
        let quorum = if quorum < 0 { serde_json::Value::Null } else { serde_json::json!(quorum) };
        match self.votes.read().get(agent_id) {
            Some(s) => serde_json::json!({
                "sdown_voters": s.sdown_voters.iter().collect::<Vec<_>>(),
                "odown_confirmed": s.odown_confirmed,
                "quorum": quorum,
            }),
            None => serde_json::json!({
                "sdown_voters": [],
                "odown_confirmed": false,
                "quorum": quorum,
            }),
        }
    }
}
