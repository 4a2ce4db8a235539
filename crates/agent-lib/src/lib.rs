//! Core library for the virtsched reconciliation agent
//!
//! This crate provides:
//! - The hypervisor driver boundary and its machine-slice implementation
//! - The state adapter: entity caching, usage telemetry, CPU pinning
//! - The fixed-period reconcile loop
//! - Health checks and Prometheus metrics

pub mod adapter;
pub mod error;
pub mod health;
pub mod hypervisor;
pub mod models;
pub mod observability;
pub mod pool;
pub mod reconciler;

pub use adapter::{build_pin_template, HypervisorAdapter, ResolveOutcome};
pub use error::HypervisorError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::AgentMetrics;
pub use pool::AllocationPool;
pub use reconciler::{ReconcileLoop, ReconcileLoopBuilder};
