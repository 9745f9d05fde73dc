//! Prometheus metrics for the clustering core, plus a rolling snapshot
//! ring buffer used to derive per-second rates.
//! Grounded on `guts-node::observability::metrics` (registry + counters/
//! gauges registered once, encoded on scrape) and
//! `examples/original_source/backend/core/cluster/metrics.py`.

use nexus_types::now_unix;
use parking_lot::RwLock;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::VecDeque;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

const RING_SIZE: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub timestamp: i64,
    pub tasks_published: i64,
    pub tasks_processed: i64,
    pub tasks_failed: i64,
    pub events_published: i64,
}

/// Registers every cluster-wide counter/gauge once, exposes `collect`
/// for components to report their current totals, and `export_prometheus`
/// for the HTTP `/metrics` endpoint.
pub struct Metrics {
    registry: Arc<RwLock<Registry>>,
    tasks_published_total: Counter<i64, AtomicI64>,
    tasks_processed_total: Counter<i64, AtomicI64>,
    tasks_failed_total: Counter<i64, AtomicI64>,
    events_published_total: Counter<i64, AtomicI64>,
    active_sessions: Gauge<i64, AtomicI64>,
    memories_stored: Gauge<i64, AtomicI64>,
    cluster_primary: Gauge<i64, AtomicI64>,

    ring: RwLock<VecDeque<Snapshot>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let tasks_published_total = Counter::default();
        registry.register(
            "nexus_tasks_published",
            "Tasks published to the priority task streams",
            tasks_published_total.clone(),
        );

        let tasks_processed_total = Counter::default();
        registry.register(
            "nexus_tasks_processed",
            "Tasks successfully processed",
            tasks_processed_total.clone(),
        );

        let tasks_failed_total = Counter::default();
        registry.register(
            "nexus_tasks_failed",
            "Tasks dead-lettered after exhausting retries",
            tasks_failed_total.clone(),
        );

        let events_published_total = Counter::default();
        registry.register(
            "nexus_events_published",
            "Events published to the event bus",
            events_published_total.clone(),
        );

        let active_sessions = Gauge::default();
        registry.register(
            "nexus_active_sessions",
            "Active working-memory sessions",
            active_sessions.clone(),
        );

        let memories_stored = Gauge::default();
        registry.register(
            "nexus_memories_stored",
            "Long-lived memories stored in the vector index",
            memories_stored.clone(),
        );

        let cluster_primary = Gauge::default();
        registry.register(
            "nexus_cluster_is_primary",
            "1 if this agent currently holds the primary role",
            cluster_primary.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            tasks_published_total,
            tasks_processed_total,
            tasks_failed_total,
            events_published_total,
            active_sessions,
            memories_stored,
            cluster_primary,
            ring: RwLock::new(VecDeque::with_capacity(RING_SIZE)),
        }
    }

    pub fn record_task_published(&self) {
        self.tasks_published_total.inc();
    }

    pub fn record_task_processed(&self) {
        self.tasks_processed_total.inc();
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed_total.inc();
    }

    pub fn record_event_published(&self) {
        self.events_published_total.inc();
    }

    pub fn set_active_sessions(&self, count: i64) {
        self.active_sessions.set(count);
    }

    pub fn set_memories_stored(&self, count: i64) {
        self.memories_stored.set(count);
    }

    pub fn set_is_primary(&self, is_primary: bool) {
        self.cluster_primary.set(if is_primary { 1 } else { 0 });
    }

    /// Pushes a point-in-time snapshot of the monotonic counters onto the
    /// ring buffer, evicting the oldest entry once full.
    pub fn collect(&self) {
        let snapshot = Snapshot {
            timestamp: now_unix(),
            tasks_published: self.tasks_published_total.get(),
            tasks_processed: self.tasks_processed_total.get(),
            tasks_failed: self.tasks_failed_total.get(),
            events_published: self.events_published_total.get(),
        };
        let mut ring = self.ring.write();
        if ring.len() == RING_SIZE {
            ring.pop_front();
        }
        ring.push_back(snapshot);
    }

    /// Per-second rate of each monotonic counter across the ring's span.
    pub fn get_rates(&self) -> serde_json::Value {
        let ring = self.ring.read();
        let (Some(first), Some(last)) = (ring.front(), ring.back()) else {
            return serde_json::json!({});
        };
        let span = (last.timestamp - first.timestamp).max(1) as f64;
        serde_json::json!({
            "tasks_published_per_sec": (last.tasks_published - first.tasks_published) as f64 / span,
            "tasks_processed_per_sec": (last.tasks_processed - first.tasks_processed) as f64 / span,
            "tasks_failed_per_sec": (last.tasks_failed - first.tasks_failed) as f64 / span,
            "events_published_per_sec": (last.events_published - first.events_published) as f64 / span,
            "samples": ring.len(),
        })
    }

    /// Encodes the registry as Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .expect("failed to encode metrics");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_60_entries() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_task_published();
            metrics.collect();
        }
        assert_eq!(metrics.ring.read().len(), RING_SIZE);
    }

    #[test]
    fn export_includes_registered_metrics() {
        let metrics = Metrics::new();
        metrics.record_task_published();
        let encoded = metrics.export_prometheus();
        assert!(encoded.contains("nexus_tasks_published"));
    }
}
