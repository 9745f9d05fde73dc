//! Broker abstraction for the Nexus clustering core.
//!
//! All coordination state lives behind the [`Broker`] trait so
//! `nexus-cluster`'s components never depend on the wire protocol
//! directly. [`memory::MemoryBroker`] is an in-process fake good enough to
//! drive every component under test; [`redis::RedisBroker`] is the real
//! implementation against a Redis-compatible server.

mod error;
mod memory;
mod redis;
mod traits;

pub use error::{BrokerError, Result};
pub use memory::MemoryBroker;
pub use redis::{RedisBroker, RedisConfig};
pub use traits::{Broker, BrokerMessage, SetOptions, StreamEntry, StreamStart, VectorHit};
