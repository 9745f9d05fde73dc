//! Sliding-window distributed rate limiting.
//! Grounded on `examples/original_source/backend/core/cluster/rate_limiter.py`.

use crate::error::Result;
use nexus_broker::Broker;
use nexus_types::now_unix;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// One caller's outcome from a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub weighted_count: f64,
    pub limit: u64,
    pub retry_after_secs: u64,
}

struct Stats {
    checks: AtomicI64,
    allowed: AtomicI64,
    denied: AtomicI64,
}

/// Sliding-window counter over two fixed windows (current + previous).
///
/// Fails open: if the broker is unreachable, `check` allows the request
/// and logs a warning, per spec.md's explicit fail-open policy. `window`
/// and `cost` are per-call, matching `rate_limiter.py::check(resource,
/// limit, window, cost)`.
pub struct RateLimiter<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    stats: Stats,
}

impl<B: Broker> RateLimiter<B> {
    pub fn new(broker: Arc<B>, prefix: String) -> Self {
        Self {
            broker,
            prefix,
            stats: Stats {
                checks: AtomicI64::new(0),
                allowed: AtomicI64::new(0),
                denied: AtomicI64::new(0),
            },
        }
    }

    fn window_index(now: i64, window_secs: u64) -> i64 {
        now / window_secs as i64
    }

    fn key(&self, resource: &str, window_index: i64) -> String {
        format!("{}ratelimit:{}:{}", self.prefix, resource, window_index)
    }

    /// Weighted sliding-window count: `previous * (1 - position) + current`.
    async fn weighted_count(&self, resource: &str, now: i64, window_secs: u64) -> Result<f64> {
        let window = window_secs as i64;
        let current_idx = Self::window_index(now, window_secs);
        let previous_idx = current_idx - 1;
        let position = (now % window) as f64 / window as f64;

        let current: i64 = self
            .broker
            .get(&self.key(resource, current_idx))
            .await?
            .and_then(|b| std::str::from_utf8(&b).ok().and_then(|s| s.parse().ok()))
            .unwrap_or(0);
        let previous: i64 = self
            .broker
            .get(&self.key(resource, previous_idx))
            .await?
            .and_then(|b| std::str::from_utf8(&b).ok().and_then(|s| s.parse().ok()))
            .unwrap_or(0);

        Ok(previous as f64 * (1.0 - position) + current as f64)
    }

    /// Increments the current window's counter by `cost` and decides
    /// whether `resource` is still within `limit`. Fails open on broker
    /// errors.
    pub async fn check(&self, resource: &str, limit: u64, window_secs: u64, cost: u64) -> RateLimitDecision {
        self.stats.checks.fetch_add(1, Ordering::SeqCst);
        let decision = match self.check_inner(resource, limit, window_secs, cost).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(resource, error = %e, "rate limiter broker error, failing open");
                RateLimitDecision {
                    allowed: true,
                    weighted_count: 0.0,
                    limit,
                    retry_after_secs: 0,
                }
            }
        };
        if decision.allowed {
            self.stats.allowed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.denied.fetch_add(1, Ordering::SeqCst);
        }
        decision
    }

    async fn check_inner(&self, resource: &str, limit: u64, window_secs: u64, cost: u64) -> Result<RateLimitDecision> {
        let now = now_unix();
        let weighted_before = self.weighted_count(resource, now, window_secs).await?;

        if weighted_before + cost as f64 > limit as f64 {
            return Ok(RateLimitDecision {
                allowed: false,
                weighted_count: weighted_before,
                limit,
                retry_after_secs: window_secs,
            });
        }

        let current_idx = Self::window_index(now, window_secs);
        let key = self.key(resource, current_idx);
        let new_count = self.broker.incrby(&key, cost as i64).await?;
        if new_count == cost as i64 {
            self.broker.expire(&key, window_secs * 2).await?;
        }

        let weighted_after = self.weighted_count(resource, now, window_secs).await?;
        Ok(RateLimitDecision {
            allowed: true,
            weighted_count: weighted_after,
            limit,
            retry_after_secs: 0,
        })
    }

    pub async fn get_usage(&self, resource: &str, window_secs: u64) -> Result<f64> {
        self.weighted_count(resource, now_unix(), window_secs).await
    }

    pub async fn reset(&self, resource: &str, window_secs: u64) -> Result<()> {
        let now = now_unix();
        let current_idx = Self::window_index(now, window_secs);
        self.broker.del(&self.key(resource, current_idx)).await?;
        self.broker.del(&self.key(resource, current_idx - 1)).await?;
        Ok(())
    }

    pub async fn get_all_usage(&self, resources: &[String], window_secs: u64) -> Result<Vec<(String, f64)>> {
        let mut out = Vec::with_capacity(resources.len());
        for resource in resources {
            out.push((resource.clone(), self.get_usage(resource, window_secs).await?));
        }
        Ok(out)
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "checks": self.stats.checks.load(Ordering::SeqCst),
            "allowed": self.stats.allowed.load(Ordering::SeqCst),
            "denied": self.stats.denied.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_broker::MemoryBroker;

    #[tokio::test]
    async fn allows_until_limit_then_blocks() {
        let broker = Arc::new(MemoryBroker::new());
        let limiter = RateLimiter::new(broker, "test:".to_string());

        for _ in 0..5 {
            let d = limiter.check("agent-1", 5, 60, 1).await;
            assert!(d.allowed);
        }
        let d = limiter.check("agent-1", 5, 60, 1).await;
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn reset_clears_usage() {
        let broker = Arc::new(MemoryBroker::new());
        let limiter = RateLimiter::new(broker, "test:".to_string());
        limiter.check("agent-1", 10, 60, 1).await;
        limiter.reset("agent-1", 60).await.unwrap();
        let usage = limiter.get_usage("agent-1", 60).await.unwrap();
        assert_eq!(usage, 0.0);
    }

    #[tokio::test]
    async fn cost_greater_than_one_is_weighed_against_limit() {
        let broker = Arc::new(MemoryBroker::new());
        let limiter = RateLimiter::new(broker, "test:".to_string());
        assert!(limiter.check("agent-1", 10, 60, 7).await.allowed);
        // 7 + 4 > 10, so this call must be denied even though 4 alone
        // would have fit.
        assert!(!limiter.check("agent-1", 10, 60, 4).await.allowed);
        let stats = limiter.get_stats();
        assert_eq!(stats["checks"], 2);
        assert_eq!(stats["allowed"], 1);
        assert_eq!(stats["denied"], 1);
    }
}
