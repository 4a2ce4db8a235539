//! Hypervisor state adapter
//!
//! Sole owner of the driver connection. Converts ephemeral VM handles into
//! cached [`VmEntity`] values, lazily defaulting and persisting
//! oversubscription metadata, computes delta-based CPU utilization and
//! instantaneous memory utilization, and builds/applies CPU pin templates
//! with an idempotent update discipline.

use crate::error::HypervisorError;
use crate::hypervisor::{HypervisorDriver, VmHandle};
use crate::models::{CpuSample, VmEntity, VmEntitySnapshot};
use crate::observability::AgentMetrics;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Oversubscription ratio generated for VMs whose descriptor carries none
pub const DEFAULT_OVERSUB_CPU_RATIO: f64 = 2.0;

/// How a resolution was satisfied.
///
/// Lets callers and tests distinguish a cache hit, a fresh read, and the
/// side-effecting branch that persisted a generated default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Entity returned unchanged from cache
    Cached,
    /// Entity rebuilt from the hypervisor; descriptor untouched
    Fresh,
    /// Entity rebuilt and a default ratio was written to the descriptor
    Defaulted,
}

/// Build a pinning template: a boolean vector of `host_cores` entries, true
/// at each authorized core.
///
/// Pure function. A core id beyond the host topology is a caller programming
/// error and fails loudly rather than truncating.
pub fn build_pin_template(
    authorized: &[usize],
    host_cores: usize,
) -> Result<Vec<bool>, HypervisorError> {
    let mut template = vec![false; host_cores];
    for &cpu in authorized {
        if cpu >= host_cores {
            return Err(HypervisorError::CpuOutOfRange { cpu, host_cores });
        }
        template[cpu] = true;
    }
    Ok(template)
}

/// Adapter between the control loop / policy pool and the hypervisor driver
pub struct HypervisorAdapter {
    driver: Arc<dyn HypervisorDriver>,
    /// Map of uuid -> live entity. Entries are whole `Arc`s, so a concurrent
    /// reader sees either the previous complete entity or the new one.
    cache: DashMap<String, Arc<VmEntity>>,
    default_oversub_ratio: f64,
    metrics: AgentMetrics,
}

impl HypervisorAdapter {
    pub fn new(driver: Arc<dyn HypervisorDriver>) -> Self {
        Self::with_default_ratio(driver, DEFAULT_OVERSUB_CPU_RATIO)
    }

    pub fn with_default_ratio(driver: Arc<dyn HypervisorDriver>, ratio: f64) -> Self {
        Self {
            driver,
            cache: DashMap::new(),
            default_oversub_ratio: ratio,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn host_core_count(&self) -> usize {
        self.driver.host_core_count()
    }

    /// VMs currently running on the host
    pub async fn list_running(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        self.driver.list_running().await
    }

    /// VMs defined but not running
    pub async fn list_defined(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        self.driver.list_defined().await
    }

    /// Union of running and defined VMs. A VM cannot be both, so no
    /// deduplication is needed.
    pub async fn list_all(&self) -> Result<Vec<VmHandle>, HypervisorError> {
        let mut handles = self.list_running().await?;
        handles.extend(self.list_defined().await?);
        Ok(handles)
    }

    /// Resolve a handle to its cached entity, reading from the hypervisor on
    /// a miss or when `force_refresh` is set.
    pub async fn resolve_entity(
        &self,
        handle: &VmHandle,
        force_refresh: bool,
    ) -> Result<Arc<VmEntity>, HypervisorError> {
        let (entity, _) = self.resolve_with_outcome(handle, force_refresh).await?;
        Ok(entity)
    }

    /// [`Self::resolve_entity`] plus the outcome of the resolution.
    pub async fn resolve_with_outcome(
        &self,
        handle: &VmHandle,
        force_refresh: bool,
    ) -> Result<(Arc<VmEntity>, ResolveOutcome), HypervisorError> {
        if !force_refresh {
            if let Some(entity) = self.cache.get(&handle.uuid) {
                return Ok((entity.clone(), ResolveOutcome::Cached));
            }
        }

        let record = self.driver.read_record(handle).await?;

        let (ratio, outcome) = match self.driver.read_oversub_ratio(handle).await? {
            Some(ratio) => (ratio, ResolveOutcome::Fresh),
            None => {
                // Read-with-default, then persist so every VM ends up with an
                // explicit, inspectable policy value. The descriptor write is
                // only honored by the hypervisor after the next VM restart.
                self.driver
                    .write_oversub_ratio(handle, self.default_oversub_ratio)
                    .await?;
                warn!(
                    vm = %record.name,
                    ratio = self.default_oversub_ratio,
                    "No oversubscription metadata on VM, defaults were generated"
                );
                self.metrics.inc_descriptor_defaults();
                (self.default_oversub_ratio, ResolveOutcome::Defaulted)
            }
        };

        let entity = Arc::new(VmEntity::new(
            record.uuid,
            record.name,
            record.memory_capacity_bytes,
            record.vcpu_count,
            record.pin_masks,
            ratio,
        ));
        self.cache.insert(handle.uuid.clone(), entity.clone());
        self.metrics.set_vms_tracked(self.cache.len() as i64);

        Ok((entity, outcome))
    }

    /// Repin every vCPU of a VM to `template` if any vCPU has drifted.
    ///
    /// Re-reads the current masks from the hypervisor; the snapshot on the
    /// entity is not authoritative. Returns the number of pin writes issued:
    /// zero when every mask already matches, one per vCPU otherwise.
    pub async fn apply_pinning(
        &self,
        entity: &VmEntity,
        template: &[bool],
    ) -> Result<usize, HypervisorError> {
        let handle = Self::handle_of(entity);
        let current = self.driver.pin_masks(&handle).await?;

        let drifted = current.len() != entity.vcpu_count as usize
            || current.iter().any(|mask| mask != template);
        if !drifted {
            return Ok(0);
        }

        for vcpu in 0..entity.vcpu_count {
            self.driver.pin_vcpu(&handle, vcpu, template).await?;
        }
        debug!(vm = %entity.name, vcpus = entity.vcpu_count, "Repinned drifted VM");
        self.metrics.add_pin_writes(entity.vcpu_count as u64);
        Ok(entity.vcpu_count as usize)
    }

    /// Normalized CPU utilization since the previous read, in `[0, 1]`.
    ///
    /// The first successful read for an entity stores a sample and yields
    /// `None`: a rate cannot be computed from a single point. A read against
    /// a VM that stopped since enumeration propagates
    /// [`HypervisorError::ConsumerNotAlive`] untouched.
    pub async fn usage_cpu(&self, entity: &VmEntity) -> Result<Option<f64>, HypervisorError> {
        let handle = Self::handle_of(entity);
        let counters = match self.driver.cpu_counters(&handle).await {
            Ok(counters) => counters,
            Err(e) => {
                if !e.is_not_alive() {
                    self.metrics.inc_usage_read_errors();
                }
                return Err(e);
            }
        };
        let epoch_ns = now_epoch_ns();

        let sample = CpuSample {
            epoch_ns,
            total_ns: counters.total_ns,
            system_ns: counters.system_ns,
            user_ns: counters.user_ns,
        };
        let Some(prev) = entity.swap_sample(sample) else {
            return Ok(None);
        };
        if epoch_ns <= prev.epoch_ns {
            return Ok(None);
        }

        let delta_cpu = counters.total_ns.saturating_sub(prev.total_ns) as f64;
        let delta_wall = (epoch_ns - prev.epoch_ns) as f64;
        let rate = delta_cpu / delta_wall / f64::from(entity.vcpu_count.max(1));
        Ok(Some(rate.min(1.0)))
    }

    /// Instantaneous memory utilization rss/actual, clamped to `[0, 1]`.
    pub async fn usage_memory(&self, entity: &VmEntity) -> Result<f64, HypervisorError> {
        let handle = Self::handle_of(entity);
        let counters = match self.driver.memory_counters(&handle).await {
            Ok(counters) => counters,
            Err(e) => {
                if !e.is_not_alive() {
                    self.metrics.inc_usage_read_errors();
                }
                return Err(e);
            }
        };

        let usage = counters.rss_bytes as f64 / counters.actual_bytes.max(1) as f64;
        Ok(usage.min(1.0))
    }

    /// Drop all cached entities; subsequent resolutions re-read everything.
    pub fn purge_cache(&self) {
        self.cache.clear();
        self.metrics.inc_cache_purges();
        self.metrics.set_vms_tracked(0);
    }

    /// Number of cached entities
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Serializable copies of every cached entity, for the state API.
    pub fn entity_snapshots(&self) -> Vec<VmEntitySnapshot> {
        self.cache.iter().map(|entry| entry.value().snapshot()).collect()
    }

    fn handle_of(entity: &VmEntity) -> VmHandle {
        VmHandle {
            uuid: entity.uuid.clone(),
            name: entity.name.clone(),
            running: true,
        }
    }
}

fn now_epoch_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0) as u64
}
