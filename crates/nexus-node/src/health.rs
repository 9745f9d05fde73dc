//! Liveness/readiness/startup HTTP probes wired to a running
//! [`nexus_cluster::ClusterManager`].
//! Grounded on `guts-node::health::mod`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response, routing::get, Json, Router};
use nexus_broker::Broker;
use nexus_cluster::ClusterManager;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub agent_id: String,
    pub role: String,
    pub cluster_status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupResponse {
    pub status: HealthStatus,
}

#[derive(Clone)]
pub struct HealthState<B: Broker> {
    start_time: Instant,
    startup_complete: Arc<AtomicBool>,
    cluster: Arc<ClusterManager<B>>,
}

impl<B: Broker + 'static> HealthState<B> {
    pub fn new(cluster: Arc<ClusterManager<B>>) -> Self {
        Self {
            start_time: Instant::now(),
            startup_complete: Arc::new(AtomicBool::new(false)),
            cluster,
        }
    }

    pub fn set_startup_complete(&self, complete: bool) {
        self.startup_complete.store(complete, Ordering::SeqCst);
    }

    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub fn health_routes<B: Broker + 'static>(state: HealthState<B>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_handler::<B>))
        .route("/health/ready", get(readiness_handler::<B>))
        .route("/health/startup", get(startup_handler::<B>))
        .with_state(state)
}

async fn liveness_handler<B: Broker + 'static>(State(state): State<HealthState<B>>) -> Response {
    let body = LivenessResponse {
        status: HealthStatus::Up,
        uptime_seconds: state.uptime(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn readiness_handler<B: Broker + 'static>(State(state): State<HealthState<B>>) -> Response {
    let ready = state.cluster.is_active();
    let body = ReadinessResponse {
        status: if ready { HealthStatus::Up } else { HealthStatus::Down },
        agent_id: state.cluster.registry.agent_id().to_string(),
        role: state.cluster.registry.role().to_string(),
        cluster_status: state.cluster.registry.status().to_string(),
    };
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body)).into_response()
}

async fn startup_handler<B: Broker + 'static>(State(state): State<HealthState<B>>) -> Response {
    let complete = state.startup_complete.load(Ordering::SeqCst);
    let body = StartupResponse {
        status: if complete { HealthStatus::Up } else { HealthStatus::Down },
    };
    let code = if complete { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body)).into_response()
}
