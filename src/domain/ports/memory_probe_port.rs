//! Port for device memory introspection.

/// Reports device memory. Used only for capacity heuristics, never for
/// correctness.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryProbePort: Send + Sync {
    /// Total physical memory in bytes.
    fn total_bytes(&self) -> u64;

    /// Memory currently available to the process in bytes.
    fn free_bytes(&self) -> u64;
}
