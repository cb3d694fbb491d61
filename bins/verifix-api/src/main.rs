mod handlers;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use verifix_common::config::VerifierConfig;
use verifix_engine::{HttpRepairOracle, MemoryResultStore, RedisResultStore, ResultStore, VerificationLoop};

pub struct AppState {
    pub verifier: VerificationLoop,
    pub store: Arc<dyn ResultStore>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("VERIFIX_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

/// Redis when reachable; otherwise results live only as long as this process.
async fn connect_store(config: &VerifierConfig) -> Arc<dyn ResultStore> {
    match RedisResultStore::connect(&config.redis_url, config.result_ttl_seconds).await {
        Ok(store) => {
            info!(redis_url = %config.redis_url, "Connected to Redis");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                redis_url = %config.redis_url,
                error = %e,
                "Redis unavailable, results will be kept in memory"
            );
            Arc::new(MemoryResultStore::new(Duration::from_secs(config.result_ttl_seconds)))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Verifix API booting...");

    let config = VerifierConfig::from_env().context("Failed to load configuration")?;
    tokio::fs::create_dir_all(&config.sandbox_root)
        .await
        .with_context(|| format!("Failed to create sandbox root {}", config.sandbox_root.display()))?;

    let store = connect_store(&config).await;

    let mut verifier = VerificationLoop::new(config.clone(), store.clone());
    match HttpRepairOracle::from_config(&config.oracle)? {
        Some(oracle) => {
            info!(model = %config.oracle.model, "Repair oracle configured");
            verifier = verifier.with_oracle(Arc::new(oracle));
        }
        None => warn!("VERIFIX_ORACLE_URL not set, failed attempts will be retried unchanged"),
    }

    info!(
        sandbox_root = %config.sandbox_root.display(),
        max_attempts = config.max_attempts(),
        timeout_secs = config.execution_timeout.as_secs(),
        memory_limit_mb = config.memory_limit_mb,
        llm_test_generation = config.llm_test_generation,
        "Verification loop ready"
    );

    let state = Arc::new(AppState { verifier, store });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}
