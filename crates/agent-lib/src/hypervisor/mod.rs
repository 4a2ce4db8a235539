//! Hypervisor management interface
//!
//! This module defines the capability boundary against the hypervisor host:
//! VM enumeration, per-VM record and counter reads, descriptor metadata
//! read/write, and per-vCPU pin-mask writes. The concrete driver reads the
//! machine slice cgroup hierarchy plus a directory of per-VM descriptor
//! documents.

mod cpulist;
mod machine_cgroup;

pub use cpulist::{format_cpu_list, parse_cpu_list};
pub use machine_cgroup::MachineCgroupDriver;

use crate::error::HypervisorError;

pub use async_trait::async_trait;

/// Ephemeral reference to one VM, valid for the call chain that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub uuid: String,
    pub name: String,
    /// Whether the VM was running when the handle was obtained
    pub running: bool,
}

/// Raw per-VM configuration read from the hypervisor.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub uuid: String,
    pub name: String,
    pub memory_capacity_bytes: u64,
    pub vcpu_count: u32,
    /// Current pin mask per vCPU, one host-core-length boolean vector each.
    /// Empty for a VM that is not running.
    pub pin_masks: Vec<Vec<bool>>,
}

/// Cumulative CPU-time counters for a running VM, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCounters {
    pub total_ns: u64,
    pub system_ns: u64,
    pub user_ns: u64,
}

/// Instantaneous memory counters for a running VM, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCounters {
    /// Resident set size
    pub rss_bytes: u64,
    /// Actual allocation currently backing the VM
    pub actual_bytes: u64,
}

/// Driver trait over the hypervisor management interface.
///
/// Calls are synchronous, bounded-latency reads/writes against host-local
/// state; no driver method retries. Stat reads against a VM that stopped
/// after enumeration fail with [`HypervisorError::ConsumerNotAlive`].
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// VMs currently running on the host
    async fn list_running(&self) -> Result<Vec<VmHandle>, HypervisorError>;

    /// VMs defined on the host but not running
    async fn list_defined(&self) -> Result<Vec<VmHandle>, HypervisorError>;

    /// Full configuration record for a VM
    async fn read_record(&self, handle: &VmHandle) -> Result<VmRecord, HypervisorError>;

    /// Cumulative CPU-time counters
    async fn cpu_counters(&self, handle: &VmHandle) -> Result<CpuCounters, HypervisorError>;

    /// Instantaneous memory counters
    async fn memory_counters(&self, handle: &VmHandle) -> Result<MemoryCounters, HypervisorError>;

    /// Oversubscription ratio persisted in the VM descriptor, if any
    async fn read_oversub_ratio(&self, handle: &VmHandle) -> Result<Option<f64>, HypervisorError>;

    /// Persist an oversubscription ratio into the VM descriptor.
    ///
    /// Descriptor-based configuration: the hypervisor only honors the new
    /// value after the VM's next restart.
    async fn write_oversub_ratio(
        &self,
        handle: &VmHandle,
        ratio: f64,
    ) -> Result<(), HypervisorError>;

    /// Current pin mask for every vCPU of a running VM
    async fn pin_masks(&self, handle: &VmHandle) -> Result<Vec<Vec<bool>>, HypervisorError>;

    /// Write one vCPU's pin mask
    async fn pin_vcpu(
        &self,
        handle: &VmHandle,
        vcpu: u32,
        mask: &[bool],
    ) -> Result<(), HypervisorError>;

    /// Number of physical cores on the host
    fn host_core_count(&self) -> usize;
}
