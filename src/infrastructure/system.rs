//! Device memory probes.

use parking_lot::Mutex;
use sysinfo::System;
use tracing::debug;

use crate::domain::ports::MemoryProbePort;

/// Reads physical memory through `sysinfo`, refreshing on every query.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    /// Creates a probe and logs the initial reading.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        debug!(
            total_mb = system.total_memory() / 1024 / 1024,
            available_mb = system.available_memory() / 1024 / 1024,
            "System memory"
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryProbe").finish_non_exhaustive()
    }
}

impl MemoryProbePort for SystemMemoryProbe {
    fn total_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.total_memory()
    }

    fn free_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Probe reporting fixed figures, for hosts that budget memory themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMemoryProbe {
    /// Reported total bytes.
    pub total: u64,
    /// Reported free bytes.
    pub free: u64,
}

impl FixedMemoryProbe {
    /// Creates a probe reporting `total` and `free` bytes.
    #[must_use]
    pub const fn new(total: u64, free: u64) -> Self {
        Self { total, free }
    }
}

impl MemoryProbePort for FixedMemoryProbe {
    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn free_bytes(&self) -> u64 {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_probe_reports_memory() {
        let probe = SystemMemoryProbe::new();
        assert!(probe.total_bytes() > 0);
    }
}
