//! Multi-agent integration scenarios, run against [`MemoryBroker`] so
//! several in-process "agents" share one broker the way a real cluster
//! shares one Redis. Mirrors spec.md's S1-S6 scenario descriptions.

use nexus_broker::MemoryBroker;
use nexus_cluster::config::{ClusterConfig, ElectionConfig};
use nexus_cluster::election::ElectionManager;
use nexus_cluster::event_bus::EventBus;
use nexus_cluster::health::HealthMonitor;
use nexus_cluster::manager::ClusterManager;
use nexus_cluster::memory_index::{MemoryIndex, StoreOutcome};
use nexus_cluster::metrics::Metrics;
use nexus_cluster::rate_limiter::RateLimiter;
use nexus_cluster::registry::AgentRegistry;
use nexus_cluster::task_stream::{Priority, TaskStream};
use nexus_cluster::working_memory::WorkingMemory;
use nexus_types::{now_unix, AgentStatus, Role};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mirrors `HealthMonitor`'s private vote-key scheme so the test can seed
/// an opinion as if cast by a peer agent.
fn sdown_vote_key(prefix: &str, agent_id: &str) -> String {
    format!("{prefix}health:sdown:{agent_id}")
}

/// Mirrors `AgentRegistry`'s private record-key scheme.
fn agent_record_key(prefix: &str, agent_id: &str) -> String {
    format!("{prefix}agent:{agent_id}")
}

// S1 - Spontaneous election: three agents start `role=auto`, the first
// becomes primary; once its heartbeat goes stale past the quorum threshold,
// the healthiest secondary (lowest current_load) is promoted and the epoch
// advances.
#[tokio::test]
async fn s1_spontaneous_election_promotes_healthiest_secondary() {
    let broker = Arc::new(MemoryBroker::new());
    let prefix = "s1:".to_string();

    let reg_a = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-a".to_string()),
        Role::Auto,
        100,
        2,
        3,
    ));
    reg_a.start().await.unwrap();
    assert_eq!(reg_a.role(), Role::Primary);

    let reg_b = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-b".to_string()),
        Role::Auto,
        100,
        2,
        3,
    ));
    reg_b.start().await.unwrap();
    assert_eq!(reg_b.role(), Role::Secondary);
    reg_b.update_load(2).await.unwrap();

    let reg_c = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-c".to_string()),
        Role::Auto,
        100,
        2,
        3,
    ));
    reg_c.start().await.unwrap();
    assert_eq!(reg_c.role(), Role::Secondary);
    reg_c.update_load(5).await.unwrap();

    // Simulate A's heartbeat going stale for 7s (interval=2, threshold=3:
    // unhealthy once missed_heartbeats >= 3, i.e. age >= 6s).
    broker
        .hset(
            &agent_record_key(&prefix, "agent-a"),
            "last_heartbeat",
            (now_unix() - 10).to_string().as_bytes(),
        )
        .await
        .unwrap();

    // Seed C's SDOWN opinion on A, as if C's own monitor already voted.
    broker
        .hset(
            &sdown_vote_key(&prefix, "agent-a"),
            "agent-c",
            now_unix().to_string().as_bytes(),
        )
        .await
        .unwrap();

    let metrics = Arc::new(Metrics::new());
    let event_bus_b = Arc::new(EventBus::new(broker.clone(), prefix.clone(), "agent-b".to_string(), metrics.clone()));
    let working_memory_b = Arc::new(WorkingMemory::new(broker.clone(), prefix.clone(), 3600, 300));
    let health_b = HealthMonitor::new(broker.clone(), reg_b.clone(), prefix.clone(), "agent-b".to_string(), event_bus_b.clone());
    let election_b = Arc::new(ElectionManager::new(
        broker.clone(),
        reg_b.clone(),
        working_memory_b,
        event_bus_b,
        prefix.clone(),
        "agent-b".to_string(),
        ElectionConfig::default(),
    ));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let election_for_cb = election_b.clone();
    health_b.set_odown_callback(Arc::new(move |_agent_id: String| {
        let election = election_for_cb.clone();
        let tx = tx.lock().unwrap().take();
        tokio::spawn(async move {
            let _ = election.trigger_election().await;
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        });
    }));

    // B's own monitoring pass adds the second SDOWN vote, reaching quorum,
    // confirming ODOWN, and cascading into B's own election attempt.
    health_b.check_once().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("election cascade timed out")
        .unwrap();

    assert_eq!(health_b.get_status("agent-a"), nexus_cluster::health::FailureState::Odown);
    assert_eq!(reg_b.role(), Role::Primary, "lower-load secondary should win the election");
    assert_eq!(reg_c.role(), Role::Secondary, "loser stays secondary");
    assert!(reg_b.global_epoch().await.unwrap() > 0, "epoch must advance on promotion");
}

// S2 - Split-brain healing: a partitioned former primary (stale epoch)
// demotes itself once it observes a peer with a newer epoch also claiming
// primary.
#[tokio::test]
async fn s2_split_brain_heals_by_demoting_stale_primary() {
    let broker = Arc::new(MemoryBroker::new());
    let prefix = "s2:".to_string();

    let reg_a = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-a".to_string()),
        Role::Primary,
        100,
        2,
        3,
    ));
    reg_a.start().await.unwrap();
    for _ in 0..3 {
        reg_a.increment_epoch().await.unwrap();
    }
    assert_eq!(reg_a.local_epoch(), 3);

    let reg_b = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-b".to_string()),
        Role::Primary,
        100,
        2,
        3,
    ));
    reg_b.start().await.unwrap();
    // B was elected while partitioned from A, bumping the (shared) epoch
    // past what A's own record still reflects.
    reg_b.increment_epoch().await.unwrap();
    assert_eq!(reg_b.local_epoch(), 4);

    let metrics = Arc::new(Metrics::new());
    let event_bus_a = Arc::new(EventBus::new(broker.clone(), prefix.clone(), "agent-a".to_string(), metrics));
    let working_memory_a = Arc::new(WorkingMemory::new(broker.clone(), prefix.clone(), 3600, 300));
    let election_a = ElectionManager::new(
        broker.clone(),
        reg_a.clone(),
        working_memory_a,
        event_bus_a,
        prefix.clone(),
        "agent-a".to_string(),
        ElectionConfig::default(),
    );
    let demoted = election_a.check_and_demote().await.unwrap();

    assert!(demoted, "stale-epoch primary should demote once it sees B's fresher epoch");
    assert_eq!(reg_a.role(), Role::Secondary);
}

// S3 - Task retry: a handler that fails twice then succeeds is retried up
// to MAX_RETRIES and the caller eventually observes the completed result.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_task_retries_then_completes() {
    let broker = Arc::new(MemoryBroker::new());
    let metrics = Arc::new(Metrics::new());
    let stream = TaskStream::new(broker.clone(), "s3:".to_string(), "agent-a".to_string(), metrics)
        .with_claim_timing(100, 1);
    stream.ensure_groups().await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_for_handler = attempts.clone();
    stream.register_handler(
        "echo",
        Arc::new(move |payload: serde_json::Value| -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<serde_json::Value, String>> + Send>> {
            let attempts = attempts_for_handler.clone();
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err("simulated timeout".to_string())
                } else {
                    Ok(payload)
                }
            })
        }),
    );

    let worker = stream.start_worker_loop();
    let claim = stream.start_claim_loop();
    let task_id = stream
        .publish(Priority::Normal, "echo", &serde_json::json!({"x": 1}))
        .await
        .unwrap();

    let result = stream.await_result(&task_id, 5).await.unwrap();
    worker.abort();
    claim.abort();

    assert_eq!(attempts.load(Ordering::SeqCst), 3, "expected three total attempts");
    let result = result.expect("task should have reached a terminal state");
    assert_eq!(result.status, nexus_cluster::task_stream::TaskResultStatus::Completed);
    assert_eq!(result.result, Some(serde_json::json!({"x": 1})));
    assert_eq!(result.attempt, 3);
}

// S4 - Rate limit across agents: three agent-local limiter handles share
// one broker-backed window, so the limit is enforced cluster-wide rather
// than per process.
#[tokio::test]
async fn s4_rate_limit_enforced_across_agents() {
    let broker = Arc::new(MemoryBroker::new());
    let limiter_a = RateLimiter::new(broker.clone(), "s4:".to_string());
    let limiter_b = RateLimiter::new(broker.clone(), "s4:".to_string());
    let limiter_c = RateLimiter::new(broker.clone(), "s4:".to_string());
    let limiters = [&limiter_a, &limiter_b, &limiter_c];

    let mut allowed = 0;
    let mut denied = 0;
    for i in 0..15 {
        let decision = limiters[i % 3].check("tool:x", 10, 60, 1).await;
        if decision.allowed {
            allowed += 1;
        } else {
            denied += 1;
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(denied, 5);

    limiter_a.reset("tool:x", 60).await.unwrap();
    assert_eq!(limiter_b.get_usage("tool:x", 60).await.unwrap(), 0.0);
    assert!(limiter_c.check("tool:x", 10, 60, 1).await.allowed);
}

// S5 - Deduplicated memory: exact-content dedup across agents (stage 2),
// then a near-identical vector from a third agent caught by nearest-
// neighbor dedup (stage 3) despite slightly different content.
#[tokio::test]
async fn s5_memory_index_dedups_across_agents() {
    let broker = Arc::new(MemoryBroker::new());
    let index_a = MemoryIndex::new(broker.clone(), "s5:".to_string(), 4);
    let index_b = MemoryIndex::new(broker.clone(), "s5:".to_string(), 4);
    let index_c = MemoryIndex::new(broker.clone(), "s5:".to_string(), 4);

    let content = serde_json::json!({"text": "User prefers dark mode"});
    let e1 = vec![1.0f32, 0.0, 0.0, 0.0];

    let outcome_a = index_a.store(None, "preference", &content, &e1).await.unwrap();
    let StoreOutcome::Inserted(id) = outcome_a else {
        panic!("expected first store to insert");
    };
    assert_eq!(index_b.count_memories().await.unwrap(), 1);

    let outcome_b = index_b.store(None, "preference", &content, &e1).await.unwrap();
    assert_eq!(outcome_b, StoreOutcome::DuplicateOf(id));
    assert_eq!(index_c.count_memories().await.unwrap(), 1, "exact-content dup must not grow the index");

    // Trailing space makes the content hash differ, so only the stage-3
    // nearest-neighbor check (distance 0.05 < 0.12 threshold) catches this.
    let content_c = serde_json::json!({"text": "User prefers dark mode "});
    let e_near = near_vector(0.95);
    let outcome_c = index_c.store(None, "preference", &content_c, &e_near).await.unwrap();
    assert!(matches!(outcome_c, StoreOutcome::DuplicateOf(_)));
    assert_eq!(index_a.count_memories().await.unwrap(), 1, "near-neighbor dup must not grow the index");
}

fn near_vector(cos_theta: f32) -> Vec<f32> {
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    vec![cos_theta, sin_theta, 0.0, 0.0]
}

// S6 - Graceful drain: a draining primary steps down (role + status) and
// releases its work claims; it must not win the election it just triggered.
#[tokio::test]
async fn s6_graceful_drain_demotes_before_releasing_claims() {
    let broker = Arc::new(MemoryBroker::new());
    let prefix = "s6:".to_string();

    let reg_a = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-a".to_string()),
        Role::Primary,
        100,
        2,
        3,
    ));
    reg_a.start().await.unwrap();
    let reg_b = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-b".to_string()),
        Role::Secondary,
        100,
        2,
        3,
    ));
    reg_b.start().await.unwrap();

    let working_memory = Arc::new(WorkingMemory::new(broker.clone(), prefix.clone(), 3600, 300));
    assert!(working_memory.claim_work("agent-a", "conv-job-1", "chat").await.unwrap());
    assert!(!working_memory.claim_work("agent-b", "conv-job-1", "chat").await.unwrap());

    let metrics = Arc::new(Metrics::new());
    let event_bus_a = Arc::new(EventBus::new(broker.clone(), prefix.clone(), "agent-a".to_string(), metrics.clone()));
    let election_a = ElectionManager::new(
        broker.clone(),
        reg_a.clone(),
        working_memory.clone(),
        event_bus_a,
        prefix.clone(),
        "agent-a".to_string(),
        ElectionConfig::default(),
    );
    election_a.initiate_drain().await.unwrap();
    assert_eq!(reg_a.role(), Role::Standby);
    assert_eq!(reg_a.status(), AgentStatus::Draining);

    let event_bus_b = Arc::new(EventBus::new(broker.clone(), prefix.clone(), "agent-b".to_string(), metrics));
    let election_b = ElectionManager::new(
        broker.clone(),
        reg_b.clone(),
        working_memory.clone(),
        event_bus_b,
        prefix.clone(),
        "agent-b".to_string(),
        ElectionConfig::default(),
    );
    let winner = election_b.trigger_election().await.unwrap();
    assert_eq!(winner.as_deref(), Some("agent-b"), "a draining agent must not win its own election");
    assert_eq!(reg_b.role(), Role::Primary);

    assert!(working_memory.release_work("agent-a", "conv-job-1").await.unwrap());
    assert!(working_memory.claim_work("agent-c", "conv-job-1", "chat").await.unwrap());

    reg_a.stop().await.unwrap();
    assert_eq!(reg_a.status(), AgentStatus::Stopped);
}

// S7 - Quorum-gated ODOWN through the production construction path: three
// agents built via `ClusterManager::new` (the same path a real process
// uses) so the full registry/event-bus/health wiring is exercised, not
// just the bare component constructors used by S1-S6.
#[tokio::test]
async fn s7_cluster_manager_confirms_odown_through_quorum() {
    let broker = Arc::new(MemoryBroker::new());
    let prefix = "s7:".to_string();

    let mut config = ClusterConfig::default();
    config.enabled = true;
    config.broker.key_prefix = prefix.clone();
    config.agent.role = "auto".to_string();
    config.agent.heartbeat_interval_secs = 2;
    config.agent.failure_threshold = 3;

    let mut config_a = config.clone();
    config_a.agent.agent_id = "agent-a".to_string();
    let mgr_a = ClusterManager::new(broker.clone(), &config_a);
    mgr_a.registry.start().await.unwrap();

    let mut config_b = config.clone();
    config_b.agent.agent_id = "agent-b".to_string();
    let mgr_b = ClusterManager::new(broker.clone(), &config_b);
    mgr_b.registry.start().await.unwrap();

    let mut config_c = config.clone();
    config_c.agent.agent_id = "agent-c".to_string();
    let mgr_c = ClusterManager::new(broker.clone(), &config_c);
    mgr_c.registry.start().await.unwrap();

    assert_eq!(mgr_a.registry.role(), Role::Primary);
    assert_eq!(mgr_b.registry.role(), Role::Secondary);
    assert_eq!(mgr_c.registry.role(), Role::Secondary);

    // Make A's heartbeat stale enough to exceed the failure threshold.
    broker
        .hset(
            &agent_record_key(&prefix, "agent-a"),
            "last_heartbeat",
            (now_unix() - 10).to_string().as_bytes(),
        )
        .await
        .unwrap();

    // With three active agents, quorum = floor(3/2)+1 = 2: one vote alone
    // must not confirm ODOWN.
    mgr_b.health.check_once().await.unwrap();
    assert_eq!(mgr_b.health.get_status("agent-a"), nexus_cluster::health::FailureState::Sdown);
    assert_eq!(mgr_b.health.get_vote_status("agent-a")["quorum"], serde_json::json!(2));

    // A second independent vote reaches quorum and confirms ODOWN.
    mgr_c.health.check_once().await.unwrap();
    assert_eq!(mgr_c.health.get_status("agent-a"), nexus_cluster::health::FailureState::Odown);

    mgr_a.registry.stop().await.unwrap();
    mgr_b.registry.stop().await.unwrap();
    mgr_c.registry.stop().await.unwrap();
}

// S8 - Lone-agent cluster: ODOWN can never be confirmed against a single
// active agent, since there is no quorum to form.
#[tokio::test]
async fn s8_lone_agent_cluster_never_confirms_odown() {
    let broker = Arc::new(MemoryBroker::new());
    let prefix = "s8:".to_string();

    let reg_a = Arc::new(AgentRegistry::new(
        broker.clone(),
        prefix.clone(),
        Some("agent-a".to_string()),
        Role::Auto,
        100,
        2,
        3,
    ));
    reg_a.start().await.unwrap();
    assert_eq!(reg_a.role(), Role::Primary);

    let metrics = Arc::new(Metrics::new());
    let event_bus_a = Arc::new(EventBus::new(broker.clone(), prefix.clone(), "agent-a".to_string(), metrics));
    let health_a = HealthMonitor::new(broker.clone(), reg_a.clone(), prefix.clone(), "agent-a".to_string(), event_bus_a);

    assert_eq!(health_a.compute_quorum().await.unwrap(), None, "a lone agent can never reach quorum");
}
