//! Agent self-registration, heartbeating, peer discovery, and the
//! config-epoch counter. Grounded on
//! `examples/original_source/backend/core/cluster/registry.py`.

use crate::error::Result;
use nexus_broker::{Broker, SetOptions};
use nexus_types::{generate_agent_id, now_unix, AgentId, AgentRecord, AgentStatus, Role};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

const CONFIG_EPOCH_KEY_SUFFIX: &str = "config_epoch";
/// Grace period during which two simultaneous `auto` claimants of primary
/// are tolerated before peers resolve the tie (spec.md §4.1, resolved in
/// DESIGN.md's Open Question #1).
pub const AUTO_ROLE_GRACE_HEARTBEATS: i64 = 2;

struct Stats {
    heartbeats_sent: AtomicI64,
    heartbeat_failures: AtomicI64,
}

/// Registers this process in the cluster and tracks peers.
pub struct AgentRegistry<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    agent_id: AgentId,
    heartbeat_interval_secs: u64,
    failure_threshold: i64,
    max_load: i64,
    host: String,
    port: u16,
    models: Vec<String>,
    capabilities: Vec<String>,

    role: RwLock<Role>,
    status: RwLock<AgentStatus>,
    local_epoch: AtomicI64,
    current_load: Arc<AtomicI64>,
    started_at: i64,

    stopped: Arc<AtomicBool>,
    heartbeat_task: RwLock<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl<B: Broker + 'static> AgentRegistry<B> {
    pub fn new(
        broker: Arc<B>,
        prefix: String,
        agent_id: Option<AgentId>,
        requested_role: Role,
        max_load: i64,
        heartbeat_interval_secs: u64,
        failure_threshold: u32,
    ) -> Self {
        Self {
            broker,
            prefix,
            agent_id: agent_id.unwrap_or_else(generate_agent_id),
            heartbeat_interval_secs,
            failure_threshold: failure_threshold as i64,
            max_load,
            host: String::new(),
            port: 0,
            models: Vec::new(),
            capabilities: Vec::new(),
            role: RwLock::new(requested_role),
            status: RwLock::new(AgentStatus::Starting),
            local_epoch: AtomicI64::new(0),
            current_load: Arc::new(AtomicI64::new(0)),
            started_at: now_unix(),
            stopped: Arc::new(AtomicBool::new(false)),
            heartbeat_task: RwLock::new(None),
            stats: Arc::new(Stats {
                heartbeats_sent: AtomicI64::new(0),
                heartbeat_failures: AtomicI64::new(0),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    pub fn local_epoch(&self) -> i64 {
        self.local_epoch.load(Ordering::SeqCst)
    }

    fn agent_key(&self, id: &str) -> String {
        format!("{}agent:{}", self.prefix, id)
    }

    fn epoch_key(&self) -> String {
        format!("{}{}", self.prefix, CONFIG_EPOCH_KEY_SUFFIX)
    }

    fn record_ttl(&self) -> u64 {
        self.heartbeat_interval_secs * self.failure_threshold as u64 * 3
    }

    /// Resolves `auto` to `primary`/`secondary` by checking for an existing
    /// healthy primary, reads (or initializes) the config epoch, writes the
    /// initial record, and launches the heartbeat loop.
    pub async fn start(&self) -> Result<()> {
        if *self.role.read() == Role::Auto {
            let peers = self.get_all_agents().await?;
            let has_healthy_primary = peers
                .iter()
                .any(|a| a.role == Role::Primary && a.healthy && !a.is_self);
            *self.role.write() = if has_healthy_primary {
                Role::Secondary
            } else {
                Role::Primary
            };
        }

        let epoch: i64 = match self.broker.get(&self.epoch_key()).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            None => {
                self.broker
                    .set(&self.epoch_key(), b"0", SetOptions::default())
                    .await?;
                0
            }
        };
        self.local_epoch.store(epoch, Ordering::SeqCst);

        *self.status.write() = AgentStatus::Active;
        self.write_record().await?;

        let task = self.spawn_heartbeat_loop();
        *self.heartbeat_task.write() = Some(task);

        tracing::info!(
            agent_id = %self.agent_id,
            role = %self.role(),
            epoch,
            "agent registered"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.heartbeat_task.write().take() {
            task.abort();
        }
        *self.status.write() = AgentStatus::Stopped;
        self.write_record().await?;
        // Short decay TTL so the record disappears quickly once stopped.
        self.broker.expire(&self.agent_key(&self.agent_id), 30).await?;
        tracing::info!(agent_id = %self.agent_id, "agent deregistered");
        Ok(())
    }

    async fn write_record(&self) -> Result<()> {
        let fields: Vec<(&str, Vec<u8>)> = vec![
            ("id", self.agent_id.clone().into_bytes()),
            ("role", self.role().to_string().into_bytes()),
            ("status", self.status().to_string().into_bytes()),
            ("host", self.host.clone().into_bytes()),
            ("port", self.port.to_string().into_bytes()),
            (
                "models",
                serde_json::to_vec(&self.models).unwrap_or_default(),
            ),
            (
                "capabilities",
                serde_json::to_vec(&self.capabilities).unwrap_or_default(),
            ),
            (
                "current_load",
                self.current_load.load(Ordering::SeqCst).to_string().into_bytes(),
            ),
            ("max_load", self.max_load.to_string().into_bytes()),
            ("last_heartbeat", now_unix().to_string().into_bytes()),
            ("started_at", self.started_at.to_string().into_bytes()),
            (
                "config_epoch",
                self.local_epoch().to_string().into_bytes(),
            ),
        ];
        let key = self.agent_key(&self.agent_id);
        self.broker.hset_all(&key, &fields).await?;
        self.broker.expire(&key, self.record_ttl()).await?;
        Ok(())
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let prefix = self.prefix.clone();
        let agent_id = self.agent_id.clone();
        let interval_secs = self.heartbeat_interval_secs;
        let ttl = self.record_ttl();
        let current_load = self.current_load.clone();
        let stopped = self.stopped.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let key = format!("{prefix}agent:{agent_id}");
            while !stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let now = now_unix().to_string();
                let load = current_load.load(Ordering::SeqCst).to_string();
                let result = async {
                    broker.hset(&key, "last_heartbeat", now.as_bytes()).await?;
                    broker.hset(&key, "current_load", load.as_bytes()).await?;
                    broker.expire(&key, ttl).await?;
                    Ok::<_, nexus_broker::BrokerError>(())
                }
                .await;
                match result {
                    Ok(()) => {
                        stats.heartbeats_sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        stats.heartbeat_failures.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(agent_id = %agent_id, error = %e, "heartbeat write failed");
                    }
                }
            }
        })
    }

    /// Scans all agent records, computes read-time fields, and sorts
    /// primary-first then by ID.
    pub async fn get_all_agents(&self) -> Result<Vec<AgentRecord>> {
        let pattern = format!("{}agent:*", self.prefix);
        let keys = self.broker.scan_keys(&pattern).await?;
        let now = now_unix();
        let mut records = Vec::new();
        for key in keys {
            if let Some(record) = self.parse_record(&key).await? {
                records.push(record.with_computed_fields(
                    &self.agent_id,
                    self.heartbeat_interval_secs as i64,
                    self.failure_threshold,
                    now,
                ));
            }
        }
        records.sort_by(|a, b| match (a.role == Role::Primary, b.role == Role::Primary) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.id.cmp(&b.id),
        });
        Ok(records)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let key = self.agent_key(agent_id);
        let now = now_unix();
        Ok(self.parse_record(&key).await?.map(|r| {
            r.with_computed_fields(
                &self.agent_id,
                self.heartbeat_interval_secs as i64,
                self.failure_threshold,
                now,
            )
        }))
    }

    async fn parse_record(&self, key: &str) -> Result<Option<AgentRecord>> {
        let hash = self.broker.hgetall(key).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        let get_string = |field: &str| -> String {
            hash.get(field)
                .and_then(|v| String::from_utf8(v.clone()).ok())
                .unwrap_or_default()
        };
        let get_i64 = |field: &str| -> i64 { get_string(field).parse().unwrap_or(0) };
        let get_u64 = |field: &str| -> u64 { get_string(field).parse().unwrap_or(0) };

        let role = match get_string("role").as_str() {
            "primary" => Role::Primary,
            "secondary" => Role::Secondary,
            "standby" => Role::Standby,
            _ => Role::Auto,
        };
        let status = match get_string("status").as_str() {
            "starting" => AgentStatus::Starting,
            "active" => AgentStatus::Active,
            "draining" => AgentStatus::Draining,
            "stopped" => AgentStatus::Stopped,
            _ => AgentStatus::Failed,
        };

        Ok(Some(AgentRecord {
            id: get_string("id"),
            role,
            status,
            host: get_string("host"),
            port: get_string("port").parse().unwrap_or(0),
            models: hash
                .get("models")
                .and_then(|v| serde_json::from_slice(v).ok())
                .unwrap_or_default(),
            capabilities: hash
                .get("capabilities")
                .and_then(|v| serde_json::from_slice(v).ok())
                .unwrap_or_default(),
            current_load: get_i64("current_load"),
            max_load: get_i64("max_load"),
            last_heartbeat: get_i64("last_heartbeat"),
            started_at: get_i64("started_at"),
            config_epoch: get_u64("config_epoch"),
            missed_heartbeats: 0,
            healthy: false,
            is_self: false,
        }))
    }

    /// Caller is responsible for legitimacy (election, demotion).
    pub async fn set_role(&self, role: Role) -> Result<()> {
        *self.role.write() = role;
        self.write_record().await
    }

    /// Caller is responsible for legitimacy (drain, deregistration).
    pub async fn set_status(&self, status: AgentStatus) -> Result<()> {
        *self.status.write() = status;
        self.write_record().await
    }

    /// Atomic `INCR` on the global counter; caches the new value locally.
    pub async fn increment_epoch(&self) -> Result<i64> {
        let new_epoch = self.broker.incr(&self.epoch_key()).await?;
        self.local_epoch.store(new_epoch, Ordering::SeqCst);
        self.write_record().await?;
        Ok(new_epoch)
    }

    pub async fn global_epoch(&self) -> Result<i64> {
        Ok(match self.broker.get(&self.epoch_key()).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            None => 0,
        })
    }

    pub fn sync_local_epoch(&self, epoch: i64) {
        self.local_epoch.store(epoch, Ordering::SeqCst);
    }

    pub async fn update_load(&self, delta: i64) -> Result<()> {
        let next = (self.current_load.load(Ordering::SeqCst) + delta).max(0);
        self.current_load.store(next, Ordering::SeqCst);
        self.write_record().await
    }

    pub fn current_load(&self) -> i64 {
        self.current_load.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "heartbeats_sent": self.stats.heartbeats_sent.load(Ordering::SeqCst),
            "heartbeat_failures": self.stats.heartbeat_failures.load(Ordering::SeqCst),
            "role": self.role().to_string(),
            "status": self.status().to_string(),
            "local_epoch": self.local_epoch(),
        })
    }
}
