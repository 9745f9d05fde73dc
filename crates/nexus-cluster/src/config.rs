//! Cluster configuration.
//!
//! Mirrors `guts-node::config::NodeConfig`'s shape: nested, individually
//! validated sub-configs, a `Default` impl with sensible values, and an
//! `from_env()` constructor reading the variables enumerated in spec.md §6.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse { key: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Top-level cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ClusterConfig {
    /// If false, `ClusterManager` constructs no subsystems and every
    /// convenience method becomes a no-op, per spec.md §4.10.
    #[serde(default)]
    pub enabled: bool,

    #[validate(nested)]
    #[serde(default)]
    pub broker: BrokerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub agent: AgentConfig,

    #[validate(nested)]
    #[serde(default)]
    pub election: ElectionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[validate(nested)]
    #[serde(default)]
    pub working_memory: WorkingMemoryConfig,

    #[validate(nested)]
    #[serde(default)]
    pub memory_index: MemoryIndexConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: BrokerConfig::default(),
            agent: AgentConfig::default(),
            election: ElectionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            working_memory: WorkingMemoryConfig::default(),
            memory_index: MemoryIndexConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BrokerConfig {
    pub url: String,
    pub password: Option<String>,
    pub tls: bool,
    pub key_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            tls: false,
            key_prefix: nexus_types::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AgentConfig {
    /// Empty means auto-generate at startup.
    pub agent_id: String,
    /// `primary` | `secondary` | `auto`.
    pub role: String,
    #[validate(range(min = 1))]
    pub max_load: i64,
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            role: "auto".to_string(),
            max_load: 100,
            heartbeat_interval_secs: 2,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ElectionConfig {
    #[validate(range(min = 1))]
    pub election_timeout_secs: u64,
    #[validate(range(min = 0))]
    pub min_secondaries: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_secs: 5,
            min_secondaries: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RateLimitConfig {
    #[validate(range(min = 1))]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WorkingMemoryConfig {
    #[validate(range(min = 1))]
    pub session_ttl_secs: u64,
    #[validate(range(min = 1))]
    pub promotion_delay_secs: u64,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            promotion_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MemoryIndexConfig {
    #[validate(range(min = 1))]
    pub vector_dims: usize,
}

impl Default for MemoryIndexConfig {
    fn default() -> Self {
        Self { vector_dims: 1536 }
    }
}

impl ClusterConfig {
    /// Loads configuration from the environment variables enumerated in
    /// spec.md §6, layering over [`ClusterConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CLUSTER_ENABLED") {
            config.enabled = parse_env("CLUSTER_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            config.broker.url = v;
        }
        if let Ok(v) = std::env::var("REDIS_PASSWORD") {
            config.broker.password = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_TLS") {
            config.broker.tls = parse_env("REDIS_TLS", &v)?;
        }
        if let Ok(v) = std::env::var("REDIS_KEY_PREFIX") {
            config.broker.key_prefix = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_AGENT_ID") {
            config.agent.agent_id = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_ROLE") {
            config.agent.role = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_MAX_LOAD") {
            config.agent.max_load = parse_env("CLUSTER_MAX_LOAD", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_HEARTBEAT_INTERVAL") {
            config.agent.heartbeat_interval_secs = parse_env("CLUSTER_HEARTBEAT_INTERVAL", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_FAILURE_THRESHOLD") {
            config.agent.failure_threshold = parse_env("CLUSTER_FAILURE_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_ELECTION_TIMEOUT") {
            config.election.election_timeout_secs = parse_env("CLUSTER_ELECTION_TIMEOUT", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_MIN_SECONDARIES") {
            config.election.min_secondaries = parse_env("CLUSTER_MIN_SECONDARIES", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_RATE_LIMIT_WINDOW") {
            config.rate_limit.window_secs = parse_env("CLUSTER_RATE_LIMIT_WINDOW", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_WORKING_MEMORY_TTL") {
            config.working_memory.session_ttl_secs = parse_env("CLUSTER_WORKING_MEMORY_TTL", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_VECTOR_DIMS") {
            config.memory_index.vector_dims = parse_env("CLUSTER_VECTOR_DIMS", &v)?;
        }
        if let Ok(v) = std::env::var("CLUSTER_MEMORY_PROMOTION_DELAY") {
            config.working_memory.promotion_delay_secs =
                parse_env("CLUSTER_MEMORY_PROMOTION_DELAY", &v)?;
        }

        Ok(config)
    }

    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let valid_roles = ["primary", "secondary", "auto"];
        if !valid_roles.contains(&self.agent.role.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid CLUSTER_ROLE '{}'; valid values: {:?}",
                self.agent.role, valid_roles
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvParse {
        key: key.to_string(),
        message: format!("could not parse {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn rejects_unknown_role() {
        let mut config = ClusterConfig::default();
        config.agent.role = "bogus".to_string();
        assert!(config.validate_config().is_err());
    }
}
