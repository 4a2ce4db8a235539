//! Machine-slice cgroup hypervisor driver
//!
//! Reads hypervisor state from two host-local sources:
//! - the machine slice of the unified cgroup hierarchy, where each running VM
//!   owns a `machine-qemu\x2d<id>\x2d<name>.scope` directory carrying
//!   `cpu.stat`, `memory.current` and per-vCPU `cpuset.cpus` files
//! - a descriptor directory of per-VM JSON documents holding the durable
//!   configuration (uuid, capacity, vCPU count, oversubscription metadata)
//!
//! Descriptor writes land on disk immediately but the hypervisor only picks
//! them up at the VM's next restart.

use super::{
    async_trait, format_cpu_list, parse_cpu_list, CpuCounters, HypervisorDriver, MemoryCounters,
    VmHandle, VmRecord,
};
use crate::error::HypervisorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SCOPE_PREFIX: &str = "machine-";
const SCOPE_SUFFIX: &str = ".scope";
const ESCAPED_DASH: &str = "\\x2d";

/// Durable per-VM descriptor document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmDescriptor {
    uuid: String,
    name: String,
    memory_bytes: u64,
    vcpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oversubscription: Option<OversubSection>,
}

/// Oversubscription metadata section of a descriptor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct OversubSection {
    cpu: f64,
}

/// Hypervisor driver backed by the machine slice and a descriptor directory
pub struct MachineCgroupDriver {
    machine_root: PathBuf,
    descriptor_root: PathBuf,
    host_cores: usize,
}

impl MachineCgroupDriver {
    /// Connect to the host-local hypervisor state.
    ///
    /// Both roots must already exist; a missing root is the fatal startup
    /// condition and the control loop must not run without it.
    pub async fn connect(
        machine_root: impl Into<PathBuf>,
        descriptor_root: impl Into<PathBuf>,
        host_cores: usize,
    ) -> Result<Self, HypervisorError> {
        let machine_root = machine_root.into();
        let descriptor_root = descriptor_root.into();

        for root in [&machine_root, &descriptor_root] {
            if fs::metadata(root).await.is_err() {
                return Err(HypervisorError::Connect { path: root.clone() });
            }
        }

        Ok(Self {
            machine_root,
            descriptor_root,
            host_cores,
        })
    }

    /// Extract the VM name from a machine scope directory name.
    ///
    /// Scope units escape dashes as `\x2d`:
    /// `machine-qemu\x2d7\x2dweb\x2d01.scope` names the VM `web-01`.
    pub fn vm_name_from_scope(dir_name: &str) -> Option<String> {
        let escaped = dir_name
            .strip_prefix(SCOPE_PREFIX)?
            .strip_suffix(SCOPE_SUFFIX)?;

        let mut segments = escaped.split(ESCAPED_DASH);
        if segments.next()? != "qemu" {
            return None;
        }
        let id = segments.next()?;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let name = segments.collect::<Vec<_>>().join("-");
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Parse cpu.stat contents into (usage, user, system) microseconds.
    pub fn parse_cpu_stat(content: &str) -> Result<(u64, u64, u64), HypervisorError> {
        let mut usage_usec = None;
        let mut user_usec = 0u64;
        let mut system_usec = 0u64;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "usage_usec" => usage_usec = value.parse().ok(),
                "user_usec" => user_usec = value.parse().unwrap_or(0),
                "system_usec" => system_usec = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        match usage_usec {
            Some(usage) => Ok((usage, user_usec, system_usec)),
            None => Err(HypervisorError::parse("cpu.stat", "missing usage_usec")),
        }
    }

    fn descriptor_path(&self, name: &str) -> PathBuf {
        self.descriptor_root.join(format!("{name}.json"))
    }

    async fn load_descriptor(&self, name: &str) -> Result<VmDescriptor, HypervisorError> {
        let path = self.descriptor_path(name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HypervisorError::DescriptorMissing {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Rewrite a descriptor document atomically (temp file + rename).
    async fn store_descriptor(&self, descriptor: &VmDescriptor) -> Result<(), HypervisorError> {
        let path = self.descriptor_path(&descriptor.name);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(descriptor)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Locate the live scope directory for a VM, if it is running.
    async fn find_scope(&self, name: &str) -> Result<Option<PathBuf>, HypervisorError> {
        let mut entries = fs::read_dir(&self.machine_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if Self::vm_name_from_scope(&dir_name).as_deref() == Some(name) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Scope directory for a VM expected to be running.
    async fn running_scope(&self, handle: &VmHandle) -> Result<PathBuf, HypervisorError> {
        match self.find_scope(&handle.name).await? {
            Some(path) => Ok(path),
            None => Err(HypervisorError::ConsumerNotAlive {
                uuid: handle.uuid.clone(),
            }),
        }
    }

    fn vcpu_cpuset_path(scope: &Path, vcpu: u32) -> PathBuf {
        scope
            .join("libvirt")
            .join(format!("vcpu{vcpu}"))
            .join("cpuset.cpus")
    }

    async fn read_pin_masks(
        &self,
        scope: &Path,
        vcpus: u32,
    ) -> Result<Vec<Vec<bool>>, HypervisorError> {
        let mut masks = Vec::with_capacity(vcpus as usize);
        for vcpu in 0..vcpus {
            let path = Self::vcpu_cpuset_path(scope, vcpu);
            // A missing or empty cpuset file means the vCPU is unrestricted.
            let list = fs::read_to_string(&path).await.unwrap_or_default();
            masks.push(parse_cpu_list(&list, self.host_cores)?);
        }
        Ok(masks)
    }

    async fn handle_for(&self, name: &str, running: bool) -> Result<VmHandle, HypervisorError> {
        let descriptor = self.load_descriptor(name).await?;
        Ok(VmHandle {
            uuid: descriptor.uuid,
            name: name.to_string(),
            running,
        })
    }
}

#[async_trait]
impl HypervisorDriver for MachineCgroupDriver {
    async fn list_running(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        let mut handles = Vec::new();
        let mut entries = fs::read_dir(&self.machine_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir_name = entry.file_name().to_string_lossy().to_string();
            match Self::vm_name_from_scope(&dir_name) {
                Some(name) => match self.handle_for(&name, true).await {
                    Ok(handle) => handles.push(handle),
                    Err(HypervisorError::DescriptorMissing { .. }) => {
                        warn!(vm = %name, "Running VM has no descriptor, skipping")
                    }
                    Err(e) => return Err(e),
                },
                None => debug!(dir = %dir_name, "Skipping non-VM machine slice entry"),
            }
        }
        Ok(handles)
    }

    async fn list_defined(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        let mut handles = Vec::new();
        let mut entries = fs::read_dir(&self.descriptor_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(".json") else {
                continue;
            };
            if self.find_scope(name).await?.is_none() {
                handles.push(self.handle_for(name, false).await?);
            }
        }
        Ok(handles)
    }

    async fn read_record(&self, handle: &VmHandle) -> Result<VmRecord, HypervisorError> {
        let descriptor = self.load_descriptor(&handle.name).await?;
        let pin_masks = match self.find_scope(&handle.name).await? {
            Some(scope) => self.read_pin_masks(&scope, descriptor.vcpus).await?,
            None => Vec::new(),
        };

        Ok(VmRecord {
            uuid: descriptor.uuid,
            name: descriptor.name,
            memory_capacity_bytes: descriptor.memory_bytes,
            vcpu_count: descriptor.vcpus,
            pin_masks,
        })
    }

    async fn cpu_counters(&self, handle: &VmHandle) -> Result<CpuCounters, HypervisorError> {
        let scope = self.running_scope(handle).await?;
        let content = match fs::read_to_string(scope.join("cpu.stat")).await {
            Ok(content) => content,
            // Scope vanished between lookup and read: the VM stopped.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HypervisorError::ConsumerNotAlive {
                    uuid: handle.uuid.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let (usage_usec, user_usec, system_usec) = Self::parse_cpu_stat(&content)?;

        Ok(CpuCounters {
            total_ns: usage_usec * 1_000,
            system_ns: system_usec * 1_000,
            user_ns: user_usec * 1_000,
        })
    }

    async fn memory_counters(&self, handle: &VmHandle) -> Result<MemoryCounters, HypervisorError> {
        let scope = self.running_scope(handle).await?;
        let current = match fs::read_to_string(scope.join("memory.current")).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HypervisorError::ConsumerNotAlive {
                    uuid: handle.uuid.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let rss_bytes: u64 = current
            .trim()
            .parse()
            .map_err(|_| HypervisorError::parse("memory.current", current.trim()))?;

        // memory.max reports the literal "max" for an unlimited VM; fall back
        // to the descriptor capacity in that case.
        let max = fs::read_to_string(scope.join("memory.max"))
            .await
            .unwrap_or_else(|_| "max".to_string());
        let actual_bytes = match max.trim() {
            "max" => self.load_descriptor(&handle.name).await?.memory_bytes,
            value => value
                .parse()
                .map_err(|_| HypervisorError::parse("memory.max", value))?,
        };

        Ok(MemoryCounters {
            rss_bytes,
            actual_bytes,
        })
    }

    async fn read_oversub_ratio(&self, handle: &VmHandle) -> Result<Option<f64>, HypervisorError> {
        let descriptor = self.load_descriptor(&handle.name).await?;
        Ok(descriptor.oversubscription.map(|section| section.cpu))
    }

    async fn write_oversub_ratio(
        &self,
        handle: &VmHandle,
        ratio: f64,
    ) -> Result<(), HypervisorError> {
        let mut descriptor = self.load_descriptor(&handle.name).await?;
        descriptor.oversubscription = Some(OversubSection { cpu: ratio });
        self.store_descriptor(&descriptor).await?;
        warn!(
            vm = %handle.name,
            ratio,
            "Descriptor oversubscription updated; takes effect after next VM restart"
        );
        Ok(())
    }

    async fn pin_masks(&self, handle: &VmHandle) -> Result<Vec<Vec<bool>>, HypervisorError> {
        let scope = self.running_scope(handle).await?;
        let descriptor = self.load_descriptor(&handle.name).await?;
        self.read_pin_masks(&scope, descriptor.vcpus).await
    }

    async fn pin_vcpu(
        &self,
        handle: &VmHandle,
        vcpu: u32,
        mask: &[bool],
    ) -> Result<(), HypervisorError> {
        let scope = self.running_scope(handle).await?;
        let path = Self::vcpu_cpuset_path(&scope, vcpu);
        fs::write(&path, format_cpu_list(mask)).await?;
        Ok(())
    }

    fn host_core_count(&self) -> usize {
        self.host_cores
    }
}
