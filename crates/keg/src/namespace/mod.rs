//! Linux namespace management.
//!
//! A container gets fresh namespaces of five kinds:
//! - UTS namespace (CLONE_NEWUTS)
//! - IPC namespace (CLONE_NEWIPC)
//! - Network namespace (CLONE_NEWNET)
//! - PID namespace (CLONE_NEWPID)
//! - Mount namespace (CLONE_NEWNS)

mod join;

use std::fmt;
use std::path::PathBuf;

pub use join::join_all;

/// One namespace kind a container is isolated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Hostname and NIS domain name.
    Uts,
    /// Network stack.
    Net,
    /// Process IDs.
    Pid,
    /// Mount table.
    Mount,
}

impl Namespace {
    /// Every kind, in the order a joining process enters them.
    ///
    /// `mnt` comes last since it changes what `/proc` resolves to.
    pub const JOIN_ORDER: [Self; 5] = [Self::Ipc, Self::Uts, Self::Net, Self::Pid, Self::Mount];

    /// Name of the namespace file under `/proc/<pid>/ns`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mount => "mnt",
        }
    }

    /// Namespace file of `pid`.
    #[must_use]
    pub fn path(self, pid: i32) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }

    /// The `clone(2)` flag creating a namespace of this kind.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(self) -> libc::c_int {
        match self {
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Uts => libc::CLONE_NEWUTS,
            Self::Net => libc::CLONE_NEWNET,
            Self::Pid => libc::CLONE_NEWPID,
            Self::Mount => libc::CLONE_NEWNS,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Namespaces requested for a new container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    namespaces: Vec<Namespace>,
}

impl NamespaceConfig {
    /// The full container set.
    #[must_use]
    pub fn container() -> Self {
        Self {
            namespaces: Namespace::JOIN_ORDER.to_vec(),
        }
    }

    /// Whether `ns` is requested.
    #[must_use]
    pub fn contains(&self, ns: Namespace) -> bool {
        self.namespaces.contains(&ns)
    }

    /// Combined `clone(2)` flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn clone_flags(&self) -> u64 {
        self.namespaces
            .iter()
            .fold(0, |flags, ns| flags | ns.clone_flag() as u64)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::container()
    }
}
