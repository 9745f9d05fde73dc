//! Fenced leader election: monotonic epoch as fencing token, lowest
//! priority score wins, distributed mutex via broker `SET NX EX`.
//! Grounded on `examples/original_source/backend/core/cluster/election.py`.

use crate::config::ElectionConfig;
use crate::error::{ClusterError, Result};
use crate::event_bus::{Channel, EventBus};
use crate::registry::AgentRegistry;
use crate::working_memory::WorkingMemory;
use nexus_broker::{Broker, SetOptions};
use nexus_types::{AgentRecord, AgentStatus, Role};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const ELECTION_LOCK_TTL_SECS: u64 = 10;
const PRIMARY_KEY_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    InProgress,
}

/// Drives primary promotion/demotion. Fails closed: any broker error
/// during the critical section aborts the election rather than risking
/// dual primaries.
pub struct ElectionManager<B: Broker> {
    broker: Arc<B>,
    registry: Arc<AgentRegistry<B>>,
    working_memory: Arc<WorkingMemory<B>>,
    event_bus: Arc<EventBus<B>>,
    prefix: String,
    self_id: String,
    config: ElectionConfig,
    phase: RwLock<ElectionPhase>,
    in_progress: Arc<AtomicBool>,
}

impl<B: Broker + 'static> ElectionManager<B> {
    pub fn new(
        broker: Arc<B>,
        registry: Arc<AgentRegistry<B>>,
        working_memory: Arc<WorkingMemory<B>>,
        event_bus: Arc<EventBus<B>>,
        prefix: String,
        self_id: String,
        config: ElectionConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            working_memory,
            event_bus,
            prefix,
            self_id,
            config,
            phase: RwLock::new(ElectionPhase::Idle),
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_key(&self) -> String {
        format!("{}election:lock", self.prefix)
    }

    fn primary_key(&self) -> String {
        format!("{}election:primary", self.prefix)
    }

    /// `(epoch_lag * 1000) + current_load`; lower wins. `epoch_lag` is how
    /// far behind the candidate's own `config_epoch` is from the cluster's
    /// global epoch, so stale replicas are deprioritized ahead of load.
    fn priority_score(candidate: &AgentRecord, global_epoch: i64) -> i64 {
        let lag = (global_epoch - candidate.config_epoch as i64).max(0);
        lag * 1000 + candidate.current_load
    }

    fn find_best_candidate(peers: &[AgentRecord], global_epoch: i64) -> Option<AgentRecord> {
        peers
            .iter()
            .filter(|a| a.role.is_election_eligible() && a.healthy && a.status == AgentStatus::Active)
            .min_by_key(|a| Self::priority_score(a, global_epoch))
            .cloned()
    }

    /// Acquires the distributed election lock, re-checks that the
    /// failed primary is still absent, picks the best candidate, bumps
    /// the epoch, and promotes. Releases the lock (only if still owned)
    /// in all exit paths.
    pub async fn trigger_election(&self) -> Result<Option<String>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClusterError::ElectionInProgress);
        }
        *self.phase.write() = ElectionPhase::InProgress;
        let result = self.run_election().await;
        *self.phase.write() = ElectionPhase::Idle;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_election(&self) -> Result<Option<String>> {
        let acquired = self
            .broker
            .set(&self.lock_key(), self.self_id.as_bytes(), SetOptions::nx_ex(ELECTION_LOCK_TTL_SECS))
            .await?;
        if !acquired {
            return Err(ClusterError::LockNotAcquired);
        }

        let outcome = async {
            let peers = self.registry.get_all_agents().await?;
            if peers.iter().any(|a| a.role == Role::Primary && a.healthy) {
                return Ok(None);
            }
            // Any existing (even unhealthy) primary record, captured before
            // promotion, for the reassignment step and the published event.
            let old_primary = peers.iter().find(|a| a.role == Role::Primary).map(|a| a.id.clone());

            let global_epoch = self.registry.global_epoch().await?;
            let Some(winner) = Self::find_best_candidate(&peers, global_epoch) else {
                tracing::warn!("election found no eligible candidate");
                return Ok(None);
            };

            let new_epoch = self.registry.increment_epoch().await?;
            self.broker
                .set(&self.primary_key(), winner.id.as_bytes(), SetOptions::ex(PRIMARY_KEY_TTL_SECS))
                .await?;

            if winner.is_self {
                self.registry.set_role(Role::Primary).await?;
                tracing::info!(agent_id = %winner.id, new_epoch, "promoted to primary");
                if let Some(old_primary_id) = &old_primary {
                    self.reassign_work(old_primary_id, &winner.id).await;
                }
            } else {
                tracing::info!(agent_id = %winner.id, new_epoch, "peer promoted to primary");
            }

            let _ = self
                .event_bus
                .publish(
                    Channel::Config,
                    "primary_elected",
                    serde_json::json!({
                        "new_primary": winner.id,
                        "old_primary": old_primary,
                        "config_epoch": new_epoch,
                    }),
                )
                .await;

            Ok(Some(winner.id))
        }
        .await;

        let _ = self
            .broker
            .del_if_eq(&self.lock_key(), self.self_id.as_bytes())
            .await;
        outcome
    }

    /// Transfers `old_primary_id`'s in-flight work claims to
    /// `new_primary_id`. Best-effort: a claim that fails to transfer is
    /// logged and skipped rather than failing the whole election.
    async fn reassign_work(&self, old_primary_id: &str, new_primary_id: &str) {
        let claims = match self.working_memory.get_agent_work(old_primary_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(old_primary_id, error = %e, "could not list failed primary's work claims");
                return;
            }
        };
        for claim in claims {
            if let Err(e) = self.working_memory.release_work(old_primary_id, &claim.conv_id).await {
                tracing::warn!(conv_id = %claim.conv_id, error = %e, "failed to release claim during reassignment");
                continue;
            }
            if let Err(e) = self
                .working_memory
                .claim_work(new_primary_id, &claim.conv_id, &claim.task_type)
                .await
            {
                tracing::warn!(conv_id = %claim.conv_id, error = %e, "failed to re-claim work during reassignment");
            }
        }
    }

    /// Reads the global epoch; if it exceeds this agent's local epoch and
    /// the recorded primary is not self, demotes: syncs the local epoch,
    /// sets role to secondary, and publishes `agent_demoted`.
    pub async fn check_and_demote(&self) -> Result<bool> {
        if self.registry.role() != Role::Primary {
            return Ok(false);
        }
        let global_epoch = self.registry.global_epoch().await?;
        if global_epoch <= self.registry.local_epoch() {
            return Ok(false);
        }
        let recorded_primary = self
            .broker
            .get(&self.primary_key())
            .await?
            .and_then(|b| String::from_utf8(b).ok());
        if recorded_primary.as_deref() == Some(self.self_id.as_str()) {
            return Ok(false);
        }

        self.registry.sync_local_epoch(global_epoch);
        self.registry.set_role(Role::Secondary).await?;
        tracing::warn!(global_epoch, "demoted self after observing a newer global epoch");
        let _ = self
            .event_bus
            .publish(
                Channel::Agent,
                "agent_demoted",
                serde_json::json!({ "agent_id": self.self_id, "global_epoch": global_epoch }),
            )
            .await;
        Ok(true)
    }

    pub async fn check_min_secondaries(&self) -> Result<bool> {
        let peers = self.registry.get_all_agents().await?;
        let healthy_secondaries = peers
            .iter()
            .filter(|a| a.role == Role::Secondary && a.healthy && !a.is_self)
            .count();
        Ok(healthy_secondaries >= self.config.min_secondaries as usize)
    }

    /// Steps this agent out of the election pool and marks it draining, so
    /// a concurrent election can't pick it back up before it shuts down.
    pub async fn initiate_drain(&self) -> Result<()> {
        self.registry.set_role(Role::Standby).await?;
        self.registry.set_status(AgentStatus::Draining).await?;
        let _ = self
            .event_bus
            .publish(Channel::Agent, "agent_draining", serde_json::json!({ "agent_id": self.self_id }))
            .await;
        Ok(())
    }

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "phase": match *self.phase.read() {
                ElectionPhase::Idle => "idle",
                ElectionPhase::InProgress => "in_progress",
            },
            "min_secondaries": self.config.min_secondaries,
            "election_timeout_secs": self.config.election_timeout_secs,
        })
    }
}
