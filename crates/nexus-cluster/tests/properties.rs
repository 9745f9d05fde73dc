//! Property-style tests over pure arithmetic extracted from the cluster
//! components: epoch monotonicity, SDOWN/ODOWN vote-quorum counting, and
//! sliding-window rate-limit decay. Mirrors `guts-p2p`/`guts-storage`'s
//! `proptest`-based dev-dependency tests.

use nexus_broker::MemoryBroker;
use nexus_cluster::registry::AgentRegistry;
use nexus_types::Role;
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    /// `AgentRegistry::increment_epoch` is a broker `INCR`: repeated calls
    /// from any number of registries sharing a prefix never decrease, and
    /// the final value equals the total number of increments issued.
    #[test]
    fn epoch_never_decreases_and_counts_increments(n_agents in 1usize..5, increments_per_agent in 0u32..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let broker = Arc::new(MemoryBroker::new());
            let prefix = "prop:".to_string();
            let mut registries = Vec::new();
            for i in 0..n_agents {
                let reg = Arc::new(AgentRegistry::new(
                    broker.clone(),
                    prefix.clone(),
                    Some(format!("agent-{i}")),
                    Role::Secondary,
                    100,
                    2,
                    3,
                ));
                reg.start().await.unwrap();
                registries.push(reg);
            }

            let mut last_seen = 0i64;
            let mut total = 0i64;
            for reg in &registries {
                for _ in 0..increments_per_agent {
                    let epoch = reg.increment_epoch().await.unwrap();
                    prop_assert!(epoch > last_seen, "epoch must strictly increase on every increment");
                    last_seen = epoch;
                    total += 1;
                }
            }
            for reg in &registries {
                prop_assert_eq!(reg.global_epoch().await.unwrap(), total);
            }
            Ok(())
        })?;
    }
}

proptest! {
    /// Quorum counting in the health monitor's SDOWN hash: once the number
    /// of distinct voters reaches `quorum`, and only then, ODOWN confirms.
    #[test]
    fn quorum_confirms_exactly_at_threshold(quorum in 1usize..6, n_voters in 0usize..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let broker = Arc::new(MemoryBroker::new());
            let key = "prop:health:sdown:victim";
            for v in 0..n_voters {
                nexus_broker::Broker::hset(broker.as_ref(), key, &format!("voter-{v}"), b"1").await.unwrap();
            }
            let votes = nexus_broker::Broker::hgetall(broker.as_ref(), key).await.unwrap();
            let would_confirm = votes.len() >= quorum;
            prop_assert_eq!(would_confirm, n_voters >= quorum);
            Ok(())
        })?;
    }
}

proptest! {
    /// The weighted sliding-window formula `previous * (1 - position) +
    /// current` decays monotonically as `position` (time through the
    /// current window) advances from 0 to 1, for any fixed previous/current
    /// counts with previous > 0.
    #[test]
    fn sliding_window_weight_decays_monotonically(
        previous in 1i64..1000,
        current in 0i64..1000,
        steps in 2u32..20,
    ) {
        let mut last_weighted = previous as f64 + current as f64;
        for step in 1..=steps {
            let position = step as f64 / steps as f64;
            let weighted = previous as f64 * (1.0 - position) + current as f64;
            prop_assert!(weighted <= last_weighted + f64::EPSILON);
            last_weighted = weighted;
        }
        // At position 1.0 the previous window's contribution must vanish.
        let at_end = previous as f64 * (1.0 - 1.0) + current as f64;
        prop_assert_eq!(at_end, current as f64);
    }
}
