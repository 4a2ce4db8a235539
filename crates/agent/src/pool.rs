//! Reference allocation pool
//!
//! The real allocation policy lives outside this agent. This pool keeps the
//! loop end-to-end functional with the simplest safe policy: every VM is
//! authorized to run on every host core, so the only pinning writes it ever
//! issues are corrections of external drift.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use virtsched_lib::{build_pin_template, AllocationPool, HypervisorAdapter};

pub struct UniformPool {
    adapter: Arc<HypervisorAdapter>,
}

impl UniformPool {
    pub fn new(adapter: Arc<HypervisorAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl AllocationPool for UniformPool {
    async fn iterate(&self, elapsed_secs: u64) -> Result<()> {
        let host_cores = self.adapter.host_core_count();
        let all_cores: Vec<usize> = (0..host_cores).collect();
        let template = build_pin_template(&all_cores, host_cores)?;

        let handles = self.adapter.list_running().await?;
        let mut reconciled = 0usize;

        for handle in &handles {
            let entity = self.adapter.resolve_entity(handle, false).await?;

            let cpu = match self.adapter.usage_cpu(&entity).await {
                Ok(usage) => usage,
                Err(e) if e.is_not_alive() => {
                    // Enumeration/stat race: the VM stopped under us. Skip it
                    // this tick; the next enumeration will drop it.
                    debug!(vm = %entity.name, "VM stopped since enumeration, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mem = match self.adapter.usage_memory(&entity).await {
                Ok(usage) => Some(usage),
                Err(e) if e.is_not_alive() => None,
                Err(e) => return Err(e.into()),
            };

            match self.adapter.apply_pinning(&entity, &template).await {
                Ok(_) => reconciled += 1,
                Err(e) if e.is_not_alive() => continue,
                Err(e) => return Err(e.into()),
            }

            debug!(
                vm = %entity.name,
                cpu_usage = ?cpu,
                mem_usage = ?mem,
                "VM reconciled"
            );
        }

        debug!(elapsed_secs, vms = handles.len(), reconciled, "Allocation pass complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;
    use virtsched_lib::hypervisor::MachineCgroupDriver;

    /// End-to-end pass over a fake host: one running VM with a drifted vCPU
    /// gets repinned to the full host set and its descriptor gains a default
    /// oversubscription ratio.
    #[tokio::test]
    async fn test_iterate_reconciles_running_vm() {
        let temp = TempDir::new().unwrap();
        let machine_root = temp.path().join("machine.slice");
        let descriptor_root = temp.path().join("domains");
        fs::create_dir_all(&machine_root).await.unwrap();
        fs::create_dir_all(&descriptor_root).await.unwrap();

        let scope = machine_root.join("machine-qemu\\x2d1\\x2dweb.scope");
        fs::create_dir_all(&scope).await.unwrap();
        fs::write(scope.join("cpu.stat"), "usage_usec 1000\nuser_usec 800\nsystem_usec 200\n")
            .await
            .unwrap();
        fs::write(scope.join("memory.current"), "1024\n").await.unwrap();
        fs::write(scope.join("memory.max"), "4096\n").await.unwrap();
        let vcpu0 = scope.join("libvirt/vcpu0");
        fs::create_dir_all(&vcpu0).await.unwrap();
        fs::write(vcpu0.join("cpuset.cpus"), "0\n").await.unwrap();

        fs::write(
            descriptor_root.join("web.json"),
            r#"{"uuid":"uuid-web","name":"web","memory_bytes":4096,"vcpus":1}"#,
        )
        .await
        .unwrap();

        let driver = MachineCgroupDriver::connect(&machine_root, &descriptor_root, 4)
            .await
            .unwrap();
        let adapter = Arc::new(HypervisorAdapter::new(Arc::new(driver)));
        let pool = UniformPool::new(adapter.clone());

        pool.iterate(0).await.unwrap();

        // Drifted vCPU repinned to the full host set
        let pinned = fs::read_to_string(vcpu0.join("cpuset.cpus")).await.unwrap();
        assert_eq!(pinned, "0-3");

        // Descriptor gained a persisted default ratio
        let descriptor = fs::read_to_string(descriptor_root.join("web.json"))
            .await
            .unwrap();
        assert!(descriptor.contains("oversubscription"));

        assert_eq!(adapter.cached_count(), 1);
    }
}
