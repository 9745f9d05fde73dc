//! Node-level configuration: HTTP bind address and logging, layered on
//! top of [`nexus_cluster::ClusterConfig`].
//! Grounded on `guts-node::config::NodeConfig`.

use nexus_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration file: {0}")]
    FileLoad(String),
    #[error(transparent)]
    Cluster(#[from] nexus_cluster::config::ConfigError),
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct NodeConfig {
    #[validate(nested)]
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[validate(nested)]
    #[serde(default)]
    pub http: HttpConfig,

    #[validate(nested)]
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HttpConfig {
    pub addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8090".parse().expect("valid default socket addr"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.cluster = ClusterConfig::from_env()?;

        if let Ok(v) = std::env::var("NEXUS_HTTP_ADDR") {
            config.http.addr = v
                .parse()
                .map_err(|_| nexus_cluster::config::ConfigError::Invalid(format!("invalid NEXUS_HTTP_ADDR {v:?}")))?;
        }
        if let Ok(v) = std::env::var("NEXUS_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("NEXUS_LOG_FORMAT") {
            config.logging.format = v;
        }
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileLoad(e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::FileLoad(e.to_string()))
    }

    pub fn merge_env(&mut self) -> Result<(), ConfigError> {
        let env_config = Self::from_env()?;
        if std::env::var("NEXUS_HTTP_ADDR").is_ok() {
            self.http.addr = env_config.http.addr;
        }
        if std::env::var("NEXUS_LOG_LEVEL").is_ok() {
            self.logging.level = env_config.logging.level;
        }
        if std::env::var("NEXUS_LOG_FORMAT").is_ok() {
            self.logging.format = env_config.logging.format;
        }
        if std::env::var("REDIS_URL").is_ok() {
            self.cluster.broker = env_config.cluster.broker;
        }
        if std::env::var("CLUSTER_AGENT_ID").is_ok() || std::env::var("CLUSTER_ROLE").is_ok() {
            self.cluster.agent = env_config.cluster.agent;
        }
        Ok(())
    }

    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.cluster.validate_config()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate_config().is_ok());
    }
}
