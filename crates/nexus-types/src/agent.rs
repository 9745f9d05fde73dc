use rand::Rng;
use serde::{Deserialize, Serialize};

/// A stable string identifier for a running agent process.
///
/// Default form is `nexus-` followed by 8 random hex characters, matching
/// the reference implementation's `_generate_agent_id`.
pub type AgentId = String;

/// Generates a fresh, randomly-suffixed agent ID.
pub fn generate_agent_id() -> AgentId {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    format!("nexus-{}", hex::encode(bytes))
}

/// Logical role of an agent within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single agent that owns scheduling and write coordination.
    Primary,
    /// Eligible to become primary via election.
    Secondary,
    /// Eligible but deprioritized relative to secondaries (cold standby).
    Standby,
    /// Role not yet decided; resolved to `Primary`/`Secondary` at registry start.
    Auto,
}

impl Role {
    /// Whether this role may be promoted during an election.
    pub fn is_election_eligible(&self) -> bool {
        matches!(self, Role::Secondary | Role::Standby | Role::Auto)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Standby => "standby",
            Role::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of an agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Active,
    Draining,
    Stopped,
    Failed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Active => "active",
            AgentStatus::Draining => "draining",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One agent's registry record, plus fields computed at read time
/// (`missed_heartbeats`, `healthy`, `is_self`) that are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub role: Role,
    pub status: AgentStatus,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub current_load: i64,
    pub max_load: i64,
    pub last_heartbeat: i64,
    pub started_at: i64,
    pub config_epoch: u64,

    /// Computed at read time: `floor((now - last_heartbeat) / heartbeat_interval)`.
    #[serde(skip)]
    pub missed_heartbeats: i64,
    /// Computed at read time: `missed_heartbeats < failure_threshold`.
    #[serde(skip)]
    pub healthy: bool,
    /// Computed at read time: whether this record belongs to the reading agent.
    #[serde(skip)]
    pub is_self: bool,
}

impl AgentRecord {
    /// Populates the read-time-only fields given the reader's perspective.
    pub fn with_computed_fields(
        mut self,
        self_id: &str,
        heartbeat_interval: i64,
        failure_threshold: i64,
        now: i64,
    ) -> Self {
        let age = (now - self.last_heartbeat).max(0);
        self.missed_heartbeats = age / heartbeat_interval.max(1);
        self.healthy = self.missed_heartbeats < failure_threshold;
        self.is_self = self.id == self_id;
        self
    }
}
