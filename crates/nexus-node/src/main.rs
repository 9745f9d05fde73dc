//! # Nexus Node
//!
//! Entry point for a standalone clustering agent process: loads
//! configuration, connects to the broker, starts every
//! `nexus-cluster` subsystem, and serves health/metrics over HTTP.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod health;
mod metrics_http;

use config::NodeConfig;
use nexus_broker::RedisBroker;
use nexus_cluster::ClusterManager;

/// Nexus clustering agent.
#[derive(Parser, Debug)]
#[command(name = "nexus-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address for health/metrics endpoints.
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("nexus={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting nexus node");

    let mut node_config = match &args.config {
        Some(path) if path.exists() => NodeConfig::from_file(path)?,
        _ => NodeConfig::default(),
    };
    node_config.merge_env()?;
    if let Some(addr) = args.http_addr {
        node_config.http.addr = addr;
    }
    node_config.validate_config()?;

    tracing::info!(
        http_addr = %node_config.http.addr,
        broker_url = %node_config.cluster.broker.url,
        cluster_enabled = node_config.cluster.enabled,
        "node configuration loaded"
    );

    let redis_config = nexus_broker::RedisConfig {
        url: node_config.cluster.broker.url.clone(),
        password: node_config.cluster.broker.password.clone(),
        tls: node_config.cluster.broker.tls,
    };
    let broker = Arc::new(
        RedisBroker::connect(&redis_config)
            .await
            .map_err(|e| anyhow::anyhow!(e))?,
    );

    let cluster = Arc::new(ClusterManager::new(broker, &node_config.cluster));
    cluster.start().await?;

    let health_state = health::HealthState::new(cluster.clone());
    health_state.set_startup_complete(true);

    let app = axum::Router::new()
        .merge(health::health_routes(health_state))
        .merge(metrics_http::metrics_routes(cluster.metrics.clone()));

    let listener = tokio::net::TcpListener::bind(node_config.http.addr).await?;
    tracing::info!(addr = %node_config.http.addr, "http server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "http server exited");
        }
    });

    tracing::info!("nexus node running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    server.abort();
    cluster.stop().await?;

    Ok(())
}
