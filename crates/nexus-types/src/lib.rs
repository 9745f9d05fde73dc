//! Shared domain types for the Nexus clustering core.
//!
//! Small, dependency-light leaf crate: the roles, statuses, and agent
//! record shape that every other `nexus-*` crate builds on.

mod agent;
mod time;

pub use agent::{AgentId, AgentRecord, AgentStatus, Role};
pub use time::{now_unix, now_unix_ms};

/// Default key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "nexus:";
