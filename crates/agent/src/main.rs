//! virtsched agent - node-local VM resource reconciler
//!
//! Runs beside a hypervisor host, watches resident VMs, tracks their CPU and
//! memory usage, and reconciles CPU pinning against the allocation policy.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use virtsched_lib::{
    health::components, hypervisor::MachineCgroupDriver, HealthRegistry, HostCpuTopology,
    HostMemory, HypervisorAdapter, ReconcileLoop,
};

mod api;
mod config;
mod pool;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting virtsched-agent");

    let config = config::AgentConfig::load()?;
    let host_cores = config.resolve_host_cores();
    let host_memory = config.resolve_host_memory_bytes();
    info!(
        node_name = %config.node_name,
        host_cores,
        host_memory,
        "Agent configured"
    );

    // A hypervisor connection is a hard startup requirement: without it the
    // loop must not run.
    let driver = MachineCgroupDriver::connect(
        &config.machine_slice_root,
        &config.descriptor_root,
        host_cores,
    )
    .await
    .with_context(|| {
        format!(
            "cannot reach hypervisor state ({} / {})",
            config.machine_slice_root, config.descriptor_root
        )
    })?;
    let adapter = Arc::new(HypervisorAdapter::with_default_ratio(
        Arc::new(driver),
        config.default_oversub_ratio,
    ));

    let health_registry = HealthRegistry::new();
    health_registry.register(components::HYPERVISOR).await;
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::API).await;

    let reconcile = ReconcileLoop::builder()
        .topology(HostCpuTopology::contiguous(host_cores))
        .memory(HostMemory {
            total_bytes: host_memory,
        })
        .adapter(adapter.clone())
        .pool(Arc::new(pool::UniformPool::new(adapter.clone())))
        .period(Duration::from_secs(config.tick_period_secs))
        .purge_interval_ticks(config.cache_purge_interval_ticks)
        .build()?;

    let (shutdown_tx, _) = broadcast::channel(4);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), adapter));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let loop_rx = shutdown_tx.subscribe();
    let loop_handle = tokio::spawn(async move { reconcile.run(loop_rx).await });

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    // The loop stops at the next tick boundary; the API drains before exit.
    loop_handle.await?;
    api_handle.await??;

    Ok(())
}
