#![allow(unsafe_code)]
//! Mount operations.
//!
//! Bind mounts, propagation changes and unmounts go through rustix.
//! Filesystem mounts that need a type and option string use `mount(2)`
//! directly.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use keg_common::{KegError, KegResult};

fn c_path(path: &Path) -> KegResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| KegError::Config {
        message: format!("path contains a NUL byte: {}", path.display()),
    })
}

fn c_str(value: &str) -> KegResult<CString> {
    CString::new(value).map_err(|_| KegError::Config {
        message: format!("mount argument contains a NUL byte: {value:?}"),
    })
}

/// Mount a filesystem of type `fstype` on `target`.
#[cfg(target_os = "linux")]
pub fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> KegResult<()> {
    tracing::debug!(source, target = %target.display(), fstype, ?data, "Mounting filesystem");

    let source_c = c_str(source)?;
    let target_c = c_path(target)?;
    let fstype_c = c_str(fstype)?;
    let data_c = data.map(c_str).transpose()?;

    // SAFETY: every pointer comes from a CString that outlives the call.
    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            fstype_c.as_ptr(),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    if ret != 0 {
        return Err(KegError::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_fs(
    _source: &str,
    _target: &Path,
    _fstype: &str,
    _flags: libc::c_ulong,
    _data: Option<&str>,
) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "mount".to_string(),
    })
}

/// Bind-mount `source` onto `target`.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> KegResult<()> {
    tracing::debug!(source = %source.display(), target = %target.display(), "Creating bind mount");
    rustix::mount::mount_bind(source, target).map_err(|e| KegError::Io(e.into()))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Make every mount under `target` private, recursively.
#[cfg(target_os = "linux")]
pub fn make_rprivate(target: &Path) -> KegResult<()> {
    use rustix::mount::{MountPropagationFlags, mount_change};

    tracing::debug!(target = %target.display(), "Making mounts private");
    mount_change(
        target,
        MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
    )
    .map_err(|e| KegError::Io(e.into()))
}

#[cfg(not(target_os = "linux"))]
pub fn make_rprivate(_target: &Path) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "mount propagation".to_string(),
    })
}

/// Outcome of an unmount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmounted {
    /// A mount was detached.
    Detached,
    /// Nothing was mounted there.
    NotMounted,
}

/// Lazily detach whatever is mounted on `target`.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> KegResult<Unmounted> {
    use rustix::io::Errno;
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Unmounting");
    match unmount(target, UnmountFlags::DETACH) {
        Ok(()) => Ok(Unmounted::Detached),
        Err(Errno::INVAL | Errno::NOENT) => Ok(Unmounted::NotMounted),
        Err(e) => Err(KegError::Io(e.into())),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> KegResult<Unmounted> {
    Err(KegError::Unsupported {
        feature: "unmount".to_string(),
    })
}

/// Mount a restricted procfs on `target`.
#[cfg(target_os = "linux")]
pub fn mount_proc(target: &Path) -> KegResult<()> {
    mount_fs(
        "proc",
        target,
        "proc",
        libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_NODEV,
        None,
    )
}

/// Mount a tmpfs for `/dev` on `target`.
#[cfg(target_os = "linux")]
pub fn mount_dev_tmpfs(target: &Path) -> KegResult<()> {
    mount_fs(
        "tmpfs",
        target,
        "tmpfs",
        libc::MS_NOSUID | libc::MS_STRICTATIME,
        Some("mode=755"),
    )
}

#[cfg(not(target_os = "linux"))]
pub fn mount_proc(_target: &Path) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "procfs".to_string(),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn mount_dev_tmpfs(_target: &Path) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "tmpfs".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_path_rejects_nul() {
        assert!(c_path(Path::new("/tmp/ok")).is_ok());
        assert!(c_path(Path::new("/tmp/bad\0path")).is_err());
    }

    #[test]
    fn unmount_of_plain_directory_is_not_mounted() {
        let temp = tempfile::tempdir().unwrap();
        // EINVAL for root, EPERM without CAP_SYS_ADMIN.
        match unmount(temp.path()) {
            Ok(outcome) => assert_eq!(outcome, Unmounted::NotMounted),
            Err(KegError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
