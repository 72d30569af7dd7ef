//! Resident memory sampling for the worker restart policy.

use sysinfo::{Pid, System};
use thiserror::Error;

/// Reports the memory currently used by the worker process.
pub trait MemoryProbe: Send {
    fn resident_bytes(&mut self) -> Result<u64, MemoryProbeError>;
}

#[derive(Debug, Error)]
pub enum MemoryProbeError {
    #[error("process {pid} is not visible to the memory probe")]
    ProcessMissing { pid: u32 },
}

/// Samples the resident set size of the current process with `sysinfo`.
pub struct SysinfoMemoryProbe {
    system: System,
    pid: u32,
}

impl SysinfoMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: std::process::id(),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn resident_bytes(&mut self) -> Result<u64, MemoryProbeError> {
        let pid = Pid::from(self.pid as usize);
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(sysinfo::Process::memory)
            .ok_or(MemoryProbeError::ProcessMissing { pid: self.pid })
    }
}

/// True when `current` exceeds `baseline` by more than `percent` percent.
#[must_use]
pub fn grew_beyond(baseline: u64, current: u64, percent: u32) -> bool {
    if baseline == 0 {
        return false;
    }
    let growth = u128::from(current.saturating_sub(baseline)) * 100;
    growth > u128::from(baseline) * u128::from(percent)
}
