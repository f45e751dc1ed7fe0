//! Per-container root filesystem.
//!
//! ```text
//! <root>/images/<image>/              lower layer (shared, read-only)
//! <root>/containers/<name>/diff       upper layer
//! <root>/containers/<name>/work       overlay scratch
//! <root>/containers/<name>/merged     container root + volume mounts
//! ```

use std::path::{Path, PathBuf};

use keg_common::{KegError, KegPaths, KegResult};

use super::image::ensure_lower;
use super::mounts::Unmounted;
use super::overlay::OverlayFs;
use super::volume::VolumeSpec;

/// Filesystem state of one container.
#[derive(Debug, Clone)]
pub struct Workspace {
    image: String,
    name: String,
    dir: PathBuf,
    overlay: OverlayFs,
}

impl Workspace {
    /// Describe the workspace of container `name` built from `image`.
    #[must_use]
    pub fn new(paths: &KegPaths, image: &str, name: &str) -> Self {
        Self {
            image: image.to_string(),
            name: name.to_string(),
            dir: paths.container(name),
            overlay: OverlayFs {
                lower_dir: paths.image_layer(image),
                upper_dir: paths.container_diff(name),
                work_dir: paths.container_work(name),
                merged_dir: paths.container_merged(name),
            },
        }
    }

    /// The merged root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.overlay.merged_dir
    }

    /// Build the workspace and return the container root.
    ///
    /// Volume specs are validated before anything touches the disk. A
    /// failure after the container directory was created tears down what
    /// was built, keeping the image layer.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidVolume`] for a malformed volume, or the
    /// error of the failing step.
    pub fn build(&self, paths: &KegPaths, volumes: &[String]) -> KegResult<PathBuf> {
        let volumes = VolumeSpec::parse_all(volumes)?;
        ensure_lower(paths, &self.image)?;

        match std::fs::create_dir(&self.dir) {
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(KegError::Config {
                    message: format!("workspace for {} already exists", self.name),
                });
            }
            result => result?,
        }

        let mut mounted = Vec::with_capacity(volumes.len());
        let result = self.assemble(&volumes, &mut mounted);
        if let Err(e) = result {
            tracing::warn!(container = %self.name, error = %e, "Workspace build failed, tearing down");
            self.teardown(&mounted, false);
            return Err(e);
        }

        tracing::info!(container = %self.name, root = %self.root().display(), "Workspace ready");
        Ok(self.root().to_path_buf())
    }

    fn assemble(&self, volumes: &[VolumeSpec], mounted: &mut Vec<VolumeSpec>) -> KegResult<()> {
        std::fs::create_dir(&self.overlay.upper_dir)?;
        std::fs::create_dir(&self.overlay.work_dir)?;
        self.overlay.mount()?;

        for volume in volumes {
            volume.mount(self.root())?;
            mounted.push(volume.clone());
        }
        Ok(())
    }

    /// Tear the workspace down. Every step is best-effort and a second
    /// call is harmless.
    ///
    /// Unparseable volume specs are skipped. The image layer is removed
    /// only when `remove_lower` is set.
    pub fn destroy(&self, volumes: &[String], remove_lower: bool) {
        let volumes: Vec<VolumeSpec> = volumes
            .iter()
            .filter_map(|spec| VolumeSpec::parse(spec).ok())
            .collect();
        self.teardown(&volumes, remove_lower);
    }

    fn teardown(&self, volumes: &[VolumeSpec], remove_lower: bool) {
        let mut detached = true;

        if self.root().exists() {
            for volume in volumes {
                if let Err(e) = volume.unmount(self.root()) {
                    tracing::error!(volume = %volume, error = %e, "Failed to unmount volume");
                    detached = false;
                }
            }
            match self.overlay.unmount() {
                Ok(Unmounted::Detached) => tracing::debug!(container = %self.name, "OverlayFS unmounted"),
                Ok(Unmounted::NotMounted) => {}
                Err(e) => {
                    tracing::error!(container = %self.name, error = %e, "Failed to unmount overlay");
                    detached = false;
                }
            }
        }

        // Never recurse into a tree that may still expose host directories.
        if detached {
            remove_tree(&self.dir);
        } else {
            tracing::warn!(dir = %self.dir.display(), "Leaving container directory in place");
        }

        if remove_lower {
            remove_tree(&self.overlay.lower_dir);
        }
    }
}

fn remove_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to remove"),
    }
}
