//! OverlayFS mount for a container root.

use std::path::PathBuf;

use keg_common::KegResult;

use super::mounts::{Unmounted, mount_fs, unmount};

/// OverlayFS layout of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFs {
    /// Read-only image layer.
    pub lower_dir: PathBuf,
    /// Writable layer.
    pub upper_dir: PathBuf,
    /// Overlay scratch directory.
    pub work_dir: PathBuf,
    /// Mount point of the merged view.
    pub merged_dir: PathBuf,
}

impl OverlayFs {
    /// Get the mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// Create the merged directory and mount the overlay on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the kernel
    /// rejects the mount.
    pub fn mount(&self) -> KegResult<()> {
        std::fs::create_dir_all(&self.merged_dir)?;
        mount_fs(
            "overlay",
            &self.merged_dir,
            "overlay",
            0,
            Some(&self.mount_options()),
        )?;
        tracing::info!(merged = %self.merged_dir.display(), "OverlayFS mounted");
        Ok(())
    }

    /// Unmount the merged view.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount is present but cannot be detached.
    pub fn unmount(&self) -> KegResult<Unmounted> {
        unmount(&self.merged_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_mount_options() {
        let overlay = OverlayFs {
            lower_dir: PathBuf::from("/var/lib/keg/images/busybox"),
            upper_dir: PathBuf::from("/var/lib/keg/containers/web/diff"),
            work_dir: PathBuf::from("/var/lib/keg/containers/web/work"),
            merged_dir: PathBuf::from("/var/lib/keg/containers/web/merged"),
        };

        assert_eq!(
            overlay.mount_options(),
            "lowerdir=/var/lib/keg/images/busybox,\
             upperdir=/var/lib/keg/containers/web/diff,\
             workdir=/var/lib/keg/containers/web/work"
        );
    }
}
