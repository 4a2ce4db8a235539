//! Allocation-policy pool seam
//!
//! The pool that decides which CPUs and how much memory each VM is entitled
//! to lives outside this crate. The control loop only needs one capability
//! from it: run one allocation pass per tick.

use anyhow::Result;

pub use async_trait::async_trait;

/// Per-tick collaborator driven by the control loop.
///
/// Implementations are expected to call back into the
/// [`HypervisorAdapter`](crate::adapter::HypervisorAdapter) to resolve
/// entities, read usage and apply pinning. `elapsed_secs` is whole wall-clock
/// seconds since the loop launched.
#[async_trait]
pub trait AllocationPool: Send + Sync {
    async fn iterate(&self, elapsed_secs: u64) -> Result<()>;
}
