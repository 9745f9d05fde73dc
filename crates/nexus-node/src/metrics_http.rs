//! `/metrics` endpoint serving [`nexus_cluster::metrics::Metrics`]'s
//! Prometheus text export.
//! Grounded on `guts-node::observability::middleware`'s metrics handler.

use axum::{body::Body, extract::State, http::StatusCode, response::Response, routing::get, Router};
use nexus_cluster::metrics::Metrics;
use std::sync::Arc;

pub fn metrics_routes(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    let body = metrics.export_prometheus();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("failed to encode metrics"))
                .expect("static response is valid")
        })
}
