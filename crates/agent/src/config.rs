//! Agent configuration

use anyhow::Result;
use serde::Deserialize;

/// Agent configuration, sourced from `VIRTSCHED_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Host name this agent runs beside
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/state
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Machine slice of the cgroup hierarchy holding VM scopes
    #[serde(default = "default_machine_slice_root")]
    pub machine_slice_root: String,

    /// Directory of per-VM descriptor documents
    #[serde(default = "default_descriptor_root")]
    pub descriptor_root: String,

    /// Reconcile tick period in seconds
    #[serde(default = "default_tick_period")]
    pub tick_period_secs: u64,

    /// Physical core count override; 0 means detect from the host
    #[serde(default)]
    pub host_cores: usize,

    /// Host memory override in bytes; 0 means detect from the host
    #[serde(default)]
    pub host_memory_bytes: u64,

    /// Purge the entity cache every N ticks; 0 disables periodic purging
    #[serde(default)]
    pub cache_purge_interval_ticks: u64,

    /// Oversubscription ratio written to descriptors that carry none
    #[serde(default = "default_oversub_ratio")]
    pub default_oversub_ratio: f64,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_machine_slice_root() -> String {
    "/sys/fs/cgroup/machine.slice".to_string()
}

fn default_descriptor_root() -> String {
    "/etc/virtsched/domains".to_string()
}

fn default_tick_period() -> u64 {
    5
}

fn default_oversub_ratio() -> f64 {
    2.0
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("VIRTSCHED"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Configured core count, falling back to host detection
    pub fn resolve_host_cores(&self) -> usize {
        if self.host_cores != 0 {
            return self.host_cores;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Configured memory size, falling back to /proc/meminfo
    pub fn resolve_host_memory_bytes(&self) -> u64 {
        if self.host_memory_bytes != 0 {
            return self.host_memory_bytes;
        }
        read_meminfo_total("/proc/meminfo").unwrap_or(0)
    }
}

/// Parse the MemTotal line of a meminfo file, returning bytes.
fn read_meminfo_total(path: &str) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("MemTotal:") {
            let kib: u64 = parts.next()?.parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_overrides_win() {
        let config = AgentConfig {
            node_name: "node-1".into(),
            api_port: 9000,
            machine_slice_root: "/tmp/machine.slice".into(),
            descriptor_root: "/tmp/domains".into(),
            tick_period_secs: 1,
            host_cores: 16,
            host_memory_bytes: 64 << 30,
            cache_purge_interval_ticks: 10,
            default_oversub_ratio: 3.0,
        };
        assert_eq!(config.resolve_host_cores(), 16);
        assert_eq!(config.resolve_host_memory_bytes(), 64 << 30);
    }

    #[test]
    fn test_detection_fallbacks_are_nonzero() {
        let config = AgentConfig {
            node_name: "node-1".into(),
            api_port: 9000,
            machine_slice_root: String::new(),
            descriptor_root: String::new(),
            tick_period_secs: 1,
            host_cores: 0,
            host_memory_bytes: 0,
            cache_purge_interval_ticks: 0,
            default_oversub_ratio: 2.0,
        };
        assert!(config.resolve_host_cores() >= 1);
    }

    #[test]
    fn test_meminfo_parsing() {
        let dir = std::env::temp_dir().join("virtsched-meminfo-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("meminfo");
        std::fs::write(&path, "MemTotal:       16384 kB\nMemFree:  8192 kB\n").unwrap();
        assert_eq!(
            read_meminfo_total(path.to_str().unwrap()),
            Some(16384 * 1024)
        );
    }
}
