//! Error types for hypervisor interaction

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the hypervisor driver and state adapter.
///
/// Nothing here is retried internally; every variant propagates to the
/// immediate caller, which decides how to handle it per tick.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Connection to the hypervisor interface could not be established.
    /// Fatal at startup: the control loop must not run without it.
    #[error("failed to connect to hypervisor interface at {}", path.display())]
    Connect { path: PathBuf },

    /// A stat query targeted a VM that was enumerated but has stopped since.
    /// Benign race between enumeration and query, not a systemic fault.
    #[error("vm {uuid} is no longer alive")]
    ConsumerNotAlive { uuid: String },

    /// No descriptor document exists for the named VM.
    #[error("no descriptor found for vm {name}")]
    DescriptorMissing { name: String },

    /// A pin template referenced a CPU id beyond the host topology.
    /// Caller programming error; never silently truncated.
    #[error("cpu {cpu} out of range for host with {host_cores} cores")]
    CpuOutOfRange { cpu: usize, host_cores: usize },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HypervisorError {
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// True for the expected enumeration/stat race.
    pub fn is_not_alive(&self) -> bool {
        matches!(self, Self::ConsumerNotAlive { .. })
    }
}
