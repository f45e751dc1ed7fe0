//! Per-container cgroup manager.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use keg_common::{KegError, KegResult};

use super::ResourceLimits;
use super::v1::{Subsystem, TASKS_FILE, find_mount_point, group_dir, inherit_cpuset};

/// Mount table of the calling process.
const SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Manages one container's group across all subsystems.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Group path relative to each hierarchy root.
    group: PathBuf,
    /// Mount table consulted for hierarchy roots.
    mountinfo: PathBuf,
}

impl CgroupManager {
    /// Manage `group` in the hierarchies mounted for this process.
    pub fn new(group: impl Into<PathBuf>) -> Self {
        Self::with_mountinfo(group, SELF_MOUNTINFO)
    }

    /// Manage `group` using an explicit mount table.
    pub fn with_mountinfo(group: impl Into<PathBuf>, mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            group: group.into(),
            mountinfo: mountinfo.into(),
        }
    }

    /// Group path relative to each hierarchy root.
    #[must_use]
    pub fn group(&self) -> &Path {
        &self.group
    }

    fn mount_point(&self, subsystem: Subsystem) -> KegResult<PathBuf> {
        let mountinfo = fs::read_to_string(&self.mountinfo)?;
        find_mount_point(&mountinfo, subsystem).ok_or_else(|| KegError::CgroupMountNotFound {
            subsystem: subsystem.name().to_string(),
        })
    }

    /// Directory of the group in `subsystem`'s hierarchy.
    ///
    /// # Errors
    ///
    /// Fails if the hierarchy is not mounted, or the group is missing and
    /// `auto_create` is off.
    pub fn subsystem_dir(&self, subsystem: Subsystem, auto_create: bool) -> KegResult<PathBuf> {
        let mount = self.mount_point(subsystem)?;
        let existed = mount.join(&self.group).is_dir();
        let dir = group_dir(&mount, &self.group, auto_create)?;
        if subsystem == Subsystem::Cpuset && !existed {
            inherit_cpuset(&mount, &dir)?;
        }
        Ok(dir)
    }

    /// Create the group in every subsystem and write each configured limit.
    pub fn set_limits(&self, limits: &ResourceLimits) {
        if limits.is_empty() {
            tracing::debug!(group = %self.group.display(), "No resource limits requested");
        }
        for subsystem in Subsystem::ALL {
            if let Err(e) = self.set_one(subsystem, limits) {
                tracing::warn!(%subsystem, group = %self.group.display(), error = %e, "Failed to set cgroup limit");
            }
        }
    }

    fn set_one(&self, subsystem: Subsystem, limits: &ResourceLimits) -> KegResult<()> {
        let dir = self.subsystem_dir(subsystem, true)?;
        if let Some(value) = subsystem.limit_value(limits) {
            fs::write(dir.join(subsystem.limit_file()), &value)?;
            tracing::debug!(%subsystem, file = subsystem.limit_file(), value = %value, "Set cgroup limit");
        }
        Ok(())
    }

    /// Move `pid` into the group of every subsystem.
    pub fn apply(&self, pid: i32) {
        for subsystem in Subsystem::ALL {
            if let Err(e) = self.apply_one(subsystem, pid) {
                tracing::warn!(%subsystem, pid, error = %e, "Failed to join cgroup");
            }
        }
    }

    fn apply_one(&self, subsystem: Subsystem, pid: i32) -> KegResult<()> {
        let tasks = self.subsystem_dir(subsystem, false)?.join(TASKS_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(&tasks)?;
        file.write_all(pid.to_string().as_bytes())?;
        tracing::debug!(%subsystem, pid, "Joined cgroup");
        Ok(())
    }

    /// Remove the group from every subsystem. Missing groups are ignored.
    pub fn destroy(&self) {
        for subsystem in Subsystem::ALL {
            if let Err(e) = self.destroy_one(subsystem) {
                tracing::warn!(%subsystem, group = %self.group.display(), error = %e, "Failed to remove cgroup");
            }
        }
    }

    fn destroy_one(&self, subsystem: Subsystem) -> KegResult<()> {
        let dir = self.mount_point(subsystem)?.join(&self.group);
        match fs::remove_dir(&dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
