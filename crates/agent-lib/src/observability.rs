//! Observability infrastructure for the reconciliation agent
//!
//! Prometheus metrics covering the control loop cadence, the entity cache
//! and hypervisor write traffic. Logs go through `tracing`; the binary
//! installs the JSON subscriber.

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for tick duration (seconds)
const TICK_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    tick_duration_seconds: Histogram,
    tick_overruns: IntCounter,
    vms_tracked: IntGauge,
    pin_writes: IntCounter,
    usage_read_errors: IntCounter,
    descriptor_defaults: IntCounter,
    cache_purges: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram!(
                "virtsched_tick_duration_seconds",
                "Wall-clock time spent in one control loop tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            tick_overruns: register_int_counter!(
                "virtsched_tick_overruns_total",
                "Ticks that ran longer than the configured period"
            )
            .expect("Failed to register tick_overruns_total"),

            vms_tracked: register_int_gauge!(
                "virtsched_vms_tracked",
                "Number of VM entities currently cached"
            )
            .expect("Failed to register vms_tracked"),

            pin_writes: register_int_counter!(
                "virtsched_pin_writes_total",
                "vCPU pin-mask writes issued to the hypervisor"
            )
            .expect("Failed to register pin_writes_total"),

            usage_read_errors: register_int_counter!(
                "virtsched_usage_read_errors_total",
                "Usage reads that failed for reasons other than a stopped VM"
            )
            .expect("Failed to register usage_read_errors_total"),

            descriptor_defaults: register_int_counter!(
                "virtsched_descriptor_defaults_total",
                "Oversubscription defaults generated and persisted to descriptors"
            )
            .expect("Failed to register descriptor_defaults_total"),

            cache_purges: register_int_counter!(
                "virtsched_cache_purges_total",
                "Entity cache purges"
            )
            .expect("Failed to register cache_purges_total"),
        }
    }
}

/// Lightweight handle to the global metrics; clones share the same registry.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
    }

    pub fn inc_tick_overruns(&self) {
        self.inner().tick_overruns.inc();
    }

    pub fn tick_overruns(&self) -> u64 {
        self.inner().tick_overruns.get()
    }

    pub fn set_vms_tracked(&self, count: i64) {
        self.inner().vms_tracked.set(count);
    }

    pub fn add_pin_writes(&self, count: u64) {
        self.inner().pin_writes.inc_by(count);
    }

    pub fn inc_usage_read_errors(&self) {
        self.inner().usage_read_errors.inc();
    }

    pub fn inc_descriptor_defaults(&self) {
        self.inner().descriptor_defaults.inc();
    }

    pub fn inc_cache_purges(&self) {
        self.inner().cache_purges.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_observable() {
        let metrics = AgentMetrics::new();
        metrics.observe_tick_duration(0.01);
        metrics.set_vms_tracked(3);
        metrics.add_pin_writes(4);
        metrics.inc_descriptor_defaults();
        metrics.inc_cache_purges();
        metrics.inc_usage_read_errors();

        let before = metrics.tick_overruns();
        metrics.inc_tick_overruns();
        assert_eq!(metrics.tick_overruns(), before + 1);
    }
}
