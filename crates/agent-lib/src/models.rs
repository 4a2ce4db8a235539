//! Core data models for the reconciliation agent

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Cumulative CPU-time sample taken from the hypervisor.
///
/// All counters are cumulative nanoseconds; a utilization rate needs two of
/// these, so the first sample for a VM yields no value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    /// Monotonic-ish wall clock at sample time, nanoseconds since epoch
    pub epoch_ns: u64,
    /// Total CPU time consumed by the VM
    pub total_ns: u64,
    /// System (kernel) share of the total
    pub system_ns: u64,
    /// User share of the total
    pub user_ns: u64,
}

/// Stable in-memory representation of one VM.
///
/// One live entity exists per UUID while cached; the adapter hands out the
/// same `Arc<VmEntity>` on every resolution until a refresh is forced or the
/// cache is purged. Only `last_sample` is mutated after construction.
#[derive(Debug)]
pub struct VmEntity {
    /// Hypervisor-assigned UUID, immutable, primary cache key
    pub uuid: String,
    /// Display name, informational only
    pub name: String,
    /// Maximum memory assigned to the VM, in bytes
    pub memory_capacity_bytes: u64,
    /// Number of virtual CPUs assigned
    pub vcpu_count: u32,
    /// Per-vCPU pin masks as observed at conversion time.
    ///
    /// Informational snapshot only; drift checks re-read from the hypervisor.
    pub cpu_pin_state: Vec<Vec<bool>>,
    /// Oversubscription factor for this VM's vCPUs against physical cores
    pub oversub_cpu_ratio: f64,
    /// Previous CPU sample, absent until the first successful usage read
    pub last_sample: Mutex<Option<CpuSample>>,
}

impl VmEntity {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        memory_capacity_bytes: u64,
        vcpu_count: u32,
        cpu_pin_state: Vec<Vec<bool>>,
        oversub_cpu_ratio: f64,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            memory_capacity_bytes,
            vcpu_count,
            cpu_pin_state,
            oversub_cpu_ratio,
            last_sample: Mutex::new(None),
        }
    }

    /// Replace the stored CPU sample, returning the previous one.
    pub fn swap_sample(&self, sample: CpuSample) -> Option<CpuSample> {
        let mut guard = self.last_sample.lock().unwrap_or_else(|e| e.into_inner());
        guard.replace(sample)
    }

    /// Whether at least one CPU sample has been stored.
    pub fn has_sample(&self) -> bool {
        self.last_sample
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Serializable copy of the entity for API exposition.
    pub fn snapshot(&self) -> VmEntitySnapshot {
        VmEntitySnapshot {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            memory_capacity_bytes: self.memory_capacity_bytes,
            vcpu_count: self.vcpu_count,
            oversub_cpu_ratio: self.oversub_cpu_ratio,
            has_cpu_sample: self.has_sample(),
        }
    }
}

/// Point-in-time copy of a cached entity, safe to serialize and ship over
/// the state API while the loop keeps mutating the live entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEntitySnapshot {
    pub uuid: String,
    pub name: String,
    pub memory_capacity_bytes: u64,
    pub vcpu_count: u32,
    pub oversub_cpu_ratio: f64,
    pub has_cpu_sample: bool,
}

/// Physical-core descriptor for the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCpuTopology {
    /// Physical core ids present on the host
    pub cores: Vec<usize>,
}

impl HostCpuTopology {
    /// Topology with core ids `0..count`
    pub fn contiguous(count: usize) -> Self {
        Self {
            cores: (0..count).collect(),
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

/// Memory descriptor for the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostMemory {
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_sample_lifecycle() {
        let entity = VmEntity::new("uuid-1", "vm-1", 1 << 30, 2, vec![], 2.0);
        assert!(!entity.has_sample());

        let first = CpuSample {
            epoch_ns: 1_000,
            total_ns: 500,
            system_ns: 100,
            user_ns: 400,
        };
        assert_eq!(entity.swap_sample(first), None);
        assert!(entity.has_sample());

        let second = CpuSample {
            epoch_ns: 2_000,
            total_ns: 900,
            system_ns: 200,
            user_ns: 700,
        };
        assert_eq!(entity.swap_sample(second), Some(first));
    }

    #[test]
    fn test_contiguous_topology() {
        let topo = HostCpuTopology::contiguous(4);
        assert_eq!(topo.cores, vec![0, 1, 2, 3]);
        assert_eq!(topo.core_count(), 4);
    }

    #[test]
    fn test_snapshot_reflects_sample_state() {
        let entity = VmEntity::new("uuid-2", "vm-2", 2 << 30, 4, vec![], 1.5);
        let snap = entity.snapshot();
        assert_eq!(snap.name, "vm-2");
        assert_eq!(snap.vcpu_count, 4);
        assert!(!snap.has_cpu_sample);
    }
}
