//! DRS controller - executor allocation for stream processing pipelines
//!
//! Ingests per-stage samples over HTTP, evaluates the queueing model every
//! tick and publishes the resulting allocation decision.

use anyhow::{Context, Result};
use controller_lib::{
    control::decision_maker_for,
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    AllocEngine, AllocationState, ControlConfig, ControlLoop,
};
use drs_controller::{api, config::ControllerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting drs-controller");

    let config = ControllerConfig::load().context("failed to load configuration")?;
    info!(controller_id = %config.controller_id, "Controller configured");

    let topology = config.build_topology()?;
    let engine = Arc::new(
        AllocEngine::new(topology, config.alloc.clone()).context("failed to create engine")?,
    );
    let allocation = Arc::new(
        AllocationState::new(
            engine.clone(),
            config.initial_allocation.clone(),
            config.budget()?,
        )
        .context("invalid initial allocation")?,
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::METRICS_STORE).await;
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::CONTROL_LOOP).await;

    let metrics = ControllerMetrics::new();
    metrics.set_stages_tracked(engine.topology().stage_count() as i64);
    metrics.set_allocated_executors(allocation.processing_total(&config.initial_allocation) as i64);

    let logger = StructuredLogger::new(&config.controller_id);
    logger.log_startup(
        CONTROLLER_VERSION,
        engine.topology().stage_count(),
        engine.waiting_model(),
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        logger.clone(),
        allocation.clone(),
    ));

    let (control, outcomes) = ControlLoop::new(
        allocation,
        decision_maker_for(config.decision_policy),
        logger.clone(),
        ControlConfig {
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            ..Default::default()
        },
    );
    let control = control.with_health(health_registry.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let control_handle = tokio::spawn(control.run(shutdown_rx));
    let recorder_handle = tokio::spawn(api::record_outcomes(outcomes, app_state.clone()));

    // Start ingestion, decision, health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_healthy(components::METRICS_STORE).await;
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    if let Err(e) = control_handle.await {
        warn!(error = %e, "Control loop task failed");
    }
    if let Err(e) = recorder_handle.await {
        warn!(error = %e, "Outcome recorder task failed");
    }
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
