//! Common error types for keg.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KegError`].
pub type KegResult<T> = Result<T, KegError>;

/// Common errors across the keg crates.
#[derive(Error, Diagnostic, Debug)]
pub enum KegError {
    /// Container not found.
    #[error("Container not found: {name}")]
    #[diagnostic(code(keg::container::not_found), help("Run `keg ps` to list containers"))]
    ContainerNotFound {
        /// The container name that was not found.
        name: String,
    },

    /// Container is in the wrong state for the requested operation.
    #[error("Container {name} is {status}, cannot {operation}")]
    #[diagnostic(code(keg::container::invalid_state))]
    InvalidState {
        /// Container name.
        name: String,
        /// Current status.
        status: String,
        /// The operation that was refused.
        operation: String,
    },

    /// Network not found.
    #[error("Network not found: {name}")]
    #[diagnostic(code(keg::network::not_found), help("Run `keg network list` to list networks"))]
    NetworkNotFound {
        /// The network name that was not found.
        name: String,
    },

    /// Network already exists.
    #[error("Network already exists: {name}")]
    #[diagnostic(code(keg::network::exists))]
    NetworkExists {
        /// The duplicated network name.
        name: String,
    },

    /// Unknown network driver.
    #[error("Unknown network driver: {driver}")]
    #[diagnostic(code(keg::network::driver), help("The only supported driver is `bridge`"))]
    UnknownDriver {
        /// The requested driver name.
        driver: String,
    },

    /// Malformed volume specification.
    #[error("Invalid volume spec: {spec}")]
    #[diagnostic(
        code(keg::volume::invalid_spec),
        help("Volumes are written as host_path:container_path")
    )]
    InvalidVolume {
        /// The rejected spec.
        spec: String,
    },

    /// Malformed port mapping.
    #[error("Invalid port mapping: {spec}")]
    #[diagnostic(
        code(keg::network::invalid_port),
        help("Port mappings are written as host_port:container_port")
    )]
    InvalidPortMapping {
        /// The rejected spec.
        spec: String,
    },

    /// Invalid memory quantity format.
    #[error("Invalid memory quantity: {value}")]
    #[diagnostic(
        code(keg::resource::invalid_quantity),
        help("Use formats like '100m', '512k', '1g' or a plain byte count")
    )]
    InvalidMemory {
        /// The invalid value.
        value: String,
    },

    /// Invalid subnet / CIDR.
    #[error("Invalid subnet: {cidr}")]
    #[diagnostic(code(keg::ipam::invalid_subnet), help("Use an IPv4 CIDR such as 172.18.0.0/24"))]
    InvalidSubnet {
        /// The rejected CIDR or address.
        cidr: String,
    },

    /// No usable address left in a subnet.
    #[error("Subnet exhausted: {subnet}")]
    #[diagnostic(code(keg::ipam::exhausted))]
    SubnetExhausted {
        /// The subnet that ran out of addresses.
        subnet: String,
    },

    /// No cgroup v1 hierarchy is mounted for a subsystem.
    #[error("Cgroup mount point not found for subsystem {subsystem}")]
    #[diagnostic(
        code(keg::cgroup::mount_not_found),
        help("keg needs cgroup v1 hierarchies mounted under /sys/fs/cgroup")
    )]
    CgroupMountNotFound {
        /// Subsystem name.
        subsystem: String,
    },

    /// Cgroup group directory missing and not created.
    #[error("Cgroup path error: {path}")]
    #[diagnostic(code(keg::cgroup::path))]
    CgroupPath {
        /// The group directory.
        path: String,
    },

    /// The init process received no command.
    #[error("Container init received an empty command")]
    #[diagnostic(code(keg::init::empty_command))]
    EmptyCommand,

    /// Target executable could not be resolved.
    #[error("Executable not found: {command}")]
    #[diagnostic(code(keg::init::not_found))]
    ExecutableNotFound {
        /// The command that was looked up.
        command: String,
    },

    /// A netlink request failed.
    #[error("Netlink {operation} failed: {message}")]
    #[diagnostic(code(keg::network::netlink))]
    Netlink {
        /// The link operation.
        operation: String,
        /// Underlying cause.
        message: String,
    },

    /// An iptables invocation failed.
    #[error("iptables {args} failed: {message}")]
    #[diagnostic(code(keg::network::iptables))]
    Iptables {
        /// The argument list.
        args: String,
        /// Underlying cause.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keg::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(keg::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(keg::permission_denied),
        help("keg manipulates namespaces, cgroups and mounts; run it as root")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(keg::unsupported), help("keg only runs on Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(keg::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(keg::internal),
        help("This is a bug in keg")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KegError {
    /// Build an [`KegError::Io`] from the current `errno`.
    #[must_use]
    pub fn last_os_error() -> Self {
        Self::Io(std::io::Error::last_os_error())
    }
}

impl From<serde_json::Error> for KegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KegError::ContainerNotFound {
            name: "web".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: web");

        let err = KegError::InvalidState {
            name: "web".to_string(),
            status: "running".to_string(),
            operation: "remove".to_string(),
        };
        assert_eq!(err.to_string(), "Container web is running, cannot remove");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KegError = io_err.into();
        assert!(matches!(err, KegError::Io(_)));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: KegError = json_err.into();
        assert!(matches!(err, KegError::Serialization(_)));
    }
}
