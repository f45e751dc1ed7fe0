//! Root switch for a fresh mount namespace.

use std::path::Path;

use keg_common::{KegError, KegResult};

/// Swap the calling process's root for `new_root`.
///
/// The host tree is made private first so nothing below propagates back,
/// `new_root` is bound onto itself to become a mount point, and the old
/// root is stacked on `.` by `pivot_root(".", ".")` and then detached.
#[cfg(target_os = "linux")]
pub fn pivot_into(new_root: &Path) -> KegResult<()> {
    use rustix::process::{chdir, pivot_root};

    use super::mounts::{bind_mount, make_rprivate, unmount};

    tracing::debug!(new_root = %new_root.display(), "Switching root");

    make_rprivate(Path::new("/"))?;
    bind_mount(new_root, new_root)?;
    chdir(new_root).map_err(|e| KegError::Io(e.into()))?;
    pivot_root(".", ".").map_err(|e| KegError::Io(e.into()))?;
    unmount(Path::new("."))?;
    chdir("/").map_err(|e| KegError::Io(e.into()))?;

    tracing::debug!("pivot_root successful");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pivot_into(_new_root: &Path) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "pivot_root".to_string(),
    })
}
