//! Fixed-period reconcile loop
//!
//! Drives one allocation pass per tick against the policy pool. Best-effort
//! cadence: a tick that overruns its period is logged and the next tick
//! starts immediately, with no catch-up skipping and no artificial elapsed
//! time. Ticks are strictly sequential; the only suspension point is the
//! inter-tick sleep.

use crate::adapter::HypervisorAdapter;
use crate::models::{HostCpuTopology, HostMemory};
use crate::observability::AgentMetrics;
use crate::pool::AllocationPool;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Loop cadence configuration
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Tick period
    pub period: Duration,
    /// Purge the entity cache every N ticks; 0 disables periodic purging
    /// and the cache lives until an explicit administrative purge.
    pub purge_interval_ticks: u64,
}

/// The control loop: owns cadence, delegates each tick to the policy pool.
pub struct ReconcileLoop {
    topology: HostCpuTopology,
    memory: HostMemory,
    adapter: Arc<HypervisorAdapter>,
    pool: Arc<dyn AllocationPool>,
    config: ReconcileConfig,
    metrics: AgentMetrics,
}

impl ReconcileLoop {
    pub fn builder() -> ReconcileLoopBuilder {
        ReconcileLoopBuilder::new()
    }

    pub fn topology(&self) -> &HostCpuTopology {
        &self.topology
    }

    pub fn host_memory(&self) -> HostMemory {
        self.memory
    }

    /// Run ticks until a shutdown signal arrives.
    ///
    /// The signal is observed between ticks only; the inter-tick sleep is
    /// uninterruptible by design.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            period_secs = self.config.period.as_secs_f64(),
            cores = self.topology.core_count(),
            memory_bytes = self.memory.total_bytes,
            "Starting reconcile loop"
        );

        let launch = Instant::now();
        let mut ticks = 0u64;

        loop {
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => {
                    info!(ticks, "Reconcile loop terminating");
                    break;
                }
            }
            self.tick(launch, &mut ticks).await;
        }
    }

    /// One iteration: allocation pass, cache maintenance, cadence keeping.
    async fn tick(&self, launch: Instant, ticks: &mut u64) {
        let begin = Instant::now();
        let elapsed_secs = begin.duration_since(launch).as_secs();

        if let Err(e) = self.pool.iterate(elapsed_secs).await {
            warn!(error = %e, elapsed_secs, "Allocation pass failed; continuing at next tick");
        }
        *ticks += 1;

        if self.config.purge_interval_ticks != 0 && *ticks % self.config.purge_interval_ticks == 0
        {
            debug!(ticks, "Purging entity cache");
            self.adapter.purge_cache();
        }

        let spent = begin.elapsed();
        self.metrics.observe_tick_duration(spent.as_secs_f64());

        match self.config.period.checked_sub(spent) {
            Some(budget) if !budget.is_zero() => tokio::time::sleep(budget).await,
            _ => {
                let overrun = spent.saturating_sub(self.config.period);
                warn!(
                    overrun_ms = overrun.as_millis() as u64,
                    "Tick overran its period; starting next tick immediately"
                );
                self.metrics.inc_tick_overruns();
            }
        }
    }
}

/// Builder for the reconcile loop; every collaborator is required.
pub struct ReconcileLoopBuilder {
    topology: Option<HostCpuTopology>,
    memory: Option<HostMemory>,
    adapter: Option<Arc<HypervisorAdapter>>,
    pool: Option<Arc<dyn AllocationPool>>,
    period: Option<Duration>,
    purge_interval_ticks: u64,
}

impl ReconcileLoopBuilder {
    pub fn new() -> Self {
        Self {
            topology: None,
            memory: None,
            adapter: None,
            pool: None,
            period: None,
            purge_interval_ticks: 0,
        }
    }

    pub fn topology(mut self, topology: HostCpuTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn memory(mut self, memory: HostMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn adapter(mut self, adapter: Arc<HypervisorAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn pool(mut self, pool: Arc<dyn AllocationPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn purge_interval_ticks(mut self, ticks: u64) -> Self {
        self.purge_interval_ticks = ticks;
        self
    }

    pub fn build(self) -> Result<ReconcileLoop> {
        let topology = self
            .topology
            .ok_or_else(|| anyhow::anyhow!("CPU topology is required"))?;
        let memory = self
            .memory
            .ok_or_else(|| anyhow::anyhow!("Memory descriptor is required"))?;
        let adapter = self
            .adapter
            .ok_or_else(|| anyhow::anyhow!("Adapter is required"))?;
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("Allocation pool is required"))?;
        let period = self
            .period
            .ok_or_else(|| anyhow::anyhow!("Tick period is required"))?;

        Ok(ReconcileLoop {
            topology,
            memory,
            adapter,
            pool,
            config: ReconcileConfig {
                period,
                purge_interval_ticks: self.purge_interval_ticks,
            },
            metrics: AgentMetrics::new(),
        })
    }
}

impl Default for ReconcileLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
