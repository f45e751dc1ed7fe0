//! Volume bind mounts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use keg_common::{KegError, KegResult};

use super::mounts::{Unmounted, bind_mount, unmount};

/// A `host_path:container_path` bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Directory on the host, created when missing.
    pub host: PathBuf,
    /// Mount point inside the container root.
    pub container: PathBuf,
}

impl VolumeSpec {
    /// Parse a `host:container` spec.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidVolume`] unless the spec has exactly two
    /// non-empty colon-separated parts.
    pub fn parse(spec: &str) -> KegResult<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => Ok(Self {
                host: PathBuf::from(host),
                container: PathBuf::from(container),
            }),
            _ => Err(KegError::InvalidVolume {
                spec: spec.to_string(),
            }),
        }
    }

    /// Parse every spec, failing on the first malformed one.
    ///
    /// # Errors
    ///
    /// Returns the error of the first malformed spec.
    pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> KegResult<Vec<Self>> {
        specs.iter().map(|s| Self::parse(s.as_ref())).collect()
    }

    /// Where the volume lands under `root`.
    #[must_use]
    pub fn target(&self, root: &Path) -> PathBuf {
        root.join(self.container.strip_prefix("/").unwrap_or(&self.container))
    }

    /// Create both ends and bind the host directory into `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or the bind fails.
    pub fn mount(&self, root: &Path) -> KegResult<()> {
        let target = self.target(root);
        std::fs::create_dir_all(&self.host)?;
        std::fs::create_dir_all(&target)?;
        bind_mount(&self.host, &target)?;
        tracing::info!(host = %self.host.display(), container = %self.container.display(), "Volume mounted");
        Ok(())
    }

    /// Detach the volume from `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount is present but cannot be detached.
    pub fn unmount(&self, root: &Path) -> KegResult<Unmounted> {
        unmount(&self.target(root))
    }
}

impl FromStr for VolumeSpec {
    type Err = KegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_volume() {
        let volume = VolumeSpec::parse("/tmp/data:/data").unwrap();
        assert_eq!(volume.host, PathBuf::from("/tmp/data"));
        assert_eq!(volume.container, PathBuf::from("/data"));
        assert_eq!(volume.to_string(), "/tmp/data:/data");
    }

    #[test]
    fn reject_malformed_volumes() {
        for bad in ["onlyonepart", ":/data", "/tmp:", "/a:/b:/c", ""] {
            assert!(
                matches!(VolumeSpec::parse(bad), Err(KegError::InvalidVolume { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn target_is_inside_root() {
        let volume = VolumeSpec::parse("/tmp/data:/srv/data").unwrap();
        assert_eq!(
            volume.target(Path::new("/merged")),
            PathBuf::from("/merged/srv/data")
        );
        let relative = VolumeSpec::parse("/tmp/data:srv").unwrap();
        assert_eq!(relative.target(Path::new("/merged")), PathBuf::from("/merged/srv"));
    }

    proptest::proptest! {
        #[test]
        fn well_formed_specs_land_under_root(
            host in "/[a-z]{1,8}(/[a-z]{1,8}){0,2}",
            container in "/?[a-z]{1,8}(/[a-z]{1,8}){0,2}",
        ) {
            let volume = VolumeSpec::parse(&format!("{host}:{container}")).unwrap();
            let root = Path::new("/merged");
            proptest::prop_assert!(volume.target(root).starts_with(root));
            proptest::prop_assert!(volume.target(root) != root);
        }
    }
}
