//! Cgroup v1 subsystems and hierarchy discovery.

use std::fs;
use std::path::{Path, PathBuf};

use keg_common::{KegError, KegResult};

use super::ResourceLimits;

/// File a process joins a v1 group through.
pub const TASKS_FILE: &str = "tasks";

/// A v1 resource controller keg drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// CPU placement.
    Cpuset,
    /// CPU weight.
    Cpu,
    /// Memory ceiling.
    Memory,
}

impl Subsystem {
    /// Every subsystem, in processing order.
    pub const ALL: [Self; 3] = [Self::Cpuset, Self::Cpu, Self::Memory];

    /// Kernel name of the controller.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpuset => "cpuset",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    /// Control file the limit is written to.
    #[must_use]
    pub const fn limit_file(self) -> &'static str {
        match self {
            Self::Cpuset => "cpuset.cpus",
            Self::Cpu => "cpu.shares",
            Self::Memory => "memory.limit_in_bytes",
        }
    }

    /// Value this subsystem writes for `limits`, if it has one.
    #[must_use]
    pub fn limit_value(self, limits: &ResourceLimits) -> Option<String> {
        match self {
            Self::Cpuset => limits.cpuset.clone().filter(|s| !s.is_empty()),
            Self::Cpu => limits.cpu_shares.map(|s| s.to_string()),
            Self::Memory => limits.memory.map(|m| m.to_string()),
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Find the mount point of the v1 hierarchy carrying `subsystem` in a
/// `/proc/<pid>/mountinfo` listing.
///
/// The last path component of the mount point is matched as a
/// comma-separated controller list, so `cpu` finds `cpu,cpuacct` but
/// never `cpuset`.
#[must_use]
pub fn find_mount_point(mountinfo: &str, subsystem: Subsystem) -> Option<PathBuf> {
    mountinfo.lines().find_map(|line| {
        let mount_point = line.split(' ').nth(4)?;
        let fstype = line.split(" - ").nth(1)?.split(' ').next()?;
        if fstype != "cgroup" || !mount_point.contains("/cgroup/") {
            return None;
        }
        let leaf = mount_point.rsplit('/').next()?;
        leaf.split(',')
            .any(|c| c == subsystem.name())
            .then(|| PathBuf::from(mount_point))
    })
}

/// Resolve `group` under `mount`, creating it when `auto_create` is set.
///
/// # Errors
///
/// Returns [`KegError::CgroupPath`] when the group is missing and may not
/// be created, or the creation error.
pub fn group_dir(mount: &Path, group: &Path, auto_create: bool) -> KegResult<PathBuf> {
    let dir = mount.join(group);
    if dir.is_dir() {
        return Ok(dir);
    }
    if !auto_create {
        return Err(KegError::CgroupPath {
            path: dir.display().to_string(),
        });
    }

    fs::create_dir_all(&dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            KegError::PermissionDenied {
                operation: format!("create cgroup {}", dir.display()),
            }
        } else {
            KegError::Io(e)
        }
    })?;
    Ok(dir)
}

/// Give freshly created cpuset groups the CPUs and memory nodes of their
/// parents. A v1 cpuset group with empty `cpuset.mems` refuses tasks.
///
/// # Errors
///
/// Returns an error if a control file cannot be read or written.
pub fn inherit_cpuset(mount: &Path, dir: &Path) -> KegResult<()> {
    let Ok(relative) = dir.strip_prefix(mount) else {
        return Ok(());
    };

    let mut parent = mount.to_path_buf();
    for component in relative.components() {
        let child = parent.join(component);
        for file in ["cpuset.cpus", "cpuset.mems"] {
            let target = child.join(file);
            let current = match fs::read_to_string(&target) {
                Ok(current) => current,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if current.trim().is_empty() {
                let inherited = fs::read_to_string(parent.join(file))?;
                fs::write(&target, inherited.trim())?;
            }
        }
        parent = child;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
25 22 0:23 / /sys/fs/cgroup ro,nosuid shared:9 - tmpfs tmpfs ro,mode=755
26 25 0:24 / /sys/fs/cgroup/unified rw,nosuid shared:10 - cgroup2 cgroup2 rw
30 25 0:28 / /sys/fs/cgroup/cpuset rw,nosuid shared:14 - cgroup cgroup rw,cpuset
31 25 0:29 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid shared:15 - cgroup cgroup rw,cpu,cpuacct
32 25 0:30 / /sys/fs/cgroup/memory rw,nosuid shared:16 - cgroup cgroup rw,memory
";

    #[test]
    fn finds_each_hierarchy() {
        assert_eq!(
            find_mount_point(MOUNTINFO, Subsystem::Cpuset),
            Some(PathBuf::from("/sys/fs/cgroup/cpuset"))
        );
        assert_eq!(
            find_mount_point(MOUNTINFO, Subsystem::Cpu),
            Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(
            find_mount_point(MOUNTINFO, Subsystem::Memory),
            Some(PathBuf::from("/sys/fs/cgroup/memory"))
        );
    }

    #[test]
    fn cpu_never_matches_cpuset_only_hierarchy() {
        let only_cpuset = MOUNTINFO
            .lines()
            .filter(|l| !l.contains("cpuacct"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(find_mount_point(&only_cpuset, Subsystem::Cpu), None);
    }

    #[test]
    fn unified_hierarchy_is_ignored() {
        let v2 = "26 25 0:24 / /sys/fs/cgroup/memory rw - cgroup2 cgroup2 rw\n";
        assert_eq!(find_mount_point(v2, Subsystem::Memory), None);
    }

    #[test]
    fn limit_values() {
        let limits = ResourceLimits {
            memory: Some(keg_common::MemoryLimit::parse("100m").unwrap()),
            cpu_shares: Some(512),
            cpuset: Some(String::new()),
        };
        assert_eq!(
            Subsystem::Memory.limit_value(&limits).as_deref(),
            Some("104857600")
        );
        assert_eq!(Subsystem::Cpu.limit_value(&limits).as_deref(), Some("512"));
        assert_eq!(Subsystem::Cpuset.limit_value(&limits), None);
    }

    #[test]
    fn group_dir_respects_auto_create() {
        let temp = tempfile::tempdir().unwrap();
        let group = Path::new("keg/web");

        assert!(matches!(
            group_dir(temp.path(), group, false),
            Err(KegError::CgroupPath { .. })
        ));
        let dir = group_dir(temp.path(), group, true).unwrap();
        assert!(dir.is_dir());
        assert_eq!(group_dir(temp.path(), group, false).unwrap(), dir);
    }

    #[test]
    fn cpuset_inherits_parent_values() {
        let temp = tempfile::tempdir().unwrap();
        let mount = temp.path();
        fs::write(mount.join("cpuset.cpus"), "0-3\n").unwrap();
        fs::write(mount.join("cpuset.mems"), "0\n").unwrap();

        let dir = mount.join("keg").join("web");
        fs::create_dir_all(&dir).unwrap();
        for level in [mount.join("keg"), dir.clone()] {
            fs::write(level.join("cpuset.cpus"), "\n").unwrap();
            fs::write(level.join("cpuset.mems"), "\n").unwrap();
        }

        inherit_cpuset(mount, &dir).unwrap();
        assert_eq!(fs::read_to_string(dir.join("cpuset.cpus")).unwrap(), "0-3");
        assert_eq!(fs::read_to_string(dir.join("cpuset.mems")).unwrap(), "0");
    }
}
