//! Cgroup v1 resource control.
//!
//! Each container gets a group named `<parent>/<container>` in every
//! registered subsystem hierarchy. Failures in one subsystem never stop
//! the others from being processed.

mod manager;
pub mod v1;

pub use manager::CgroupManager;
pub use v1::Subsystem;

use keg_common::MemoryLimit;

/// Resource limits for one container. `None` leaves a dimension alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling.
    pub memory: Option<MemoryLimit>,
    /// Relative CPU weight.
    pub cpu_shares: Option<u64>,
    /// CPUs the container may run on, e.g. `0-2`.
    pub cpuset: Option<String>,
}

impl ResourceLimits {
    /// Whether no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu_shares.is_none() && self.cpuset.is_none()
    }
}
