//! Standard filesystem paths for keg.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for images and container layers.
pub static KEG_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/keg"))
});

/// Default runtime directory for records, logs and network state.
pub static KEG_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/keg"))
});

/// Name of the container record file.
pub const RECORD_FILE: &str = "config.json";

/// Name of the detached container log file.
pub const LOG_FILE: &str = "container.log";

/// Standard paths used by the keg runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KegPaths {
    /// Root data directory (default: /var/lib/keg).
    pub root: PathBuf,
    /// Runtime directory (default: /var/run/keg).
    pub runtime: PathBuf,
}

impl KegPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding image archives and extracted lower layers.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Extracted lower layer of an image.
    #[must_use]
    pub fn image_layer(&self, image: &str) -> PathBuf {
        self.images().join(image)
    }

    /// Candidate archive paths for an image, in lookup order.
    #[must_use]
    pub fn image_archives(&self, image: &str) -> [PathBuf; 2] {
        [
            self.images().join(format!("{image}.tar")),
            self.images().join(format!("{image}.tar.gz")),
        ]
    }

    /// Directory for container layers.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Layer directory of a specific container.
    #[must_use]
    pub fn container(&self, name: &str) -> PathBuf {
        self.containers().join(name)
    }

    /// Writable overlay layer.
    #[must_use]
    pub fn container_diff(&self, name: &str) -> PathBuf {
        self.container(name).join("diff")
    }

    /// Overlay work directory.
    #[must_use]
    pub fn container_work(&self, name: &str) -> PathBuf {
        self.container(name).join("work")
    }

    /// Merged view used as the container root.
    #[must_use]
    pub fn container_merged(&self, name: &str) -> PathBuf {
        self.container(name).join("merged")
    }

    /// Directory holding container records.
    #[must_use]
    pub fn records(&self) -> PathBuf {
        self.runtime.join("containers")
    }

    /// Runtime directory of a specific container.
    #[must_use]
    pub fn record_dir(&self, name: &str) -> PathBuf {
        self.records().join(name)
    }

    /// Container record file.
    #[must_use]
    pub fn record(&self, name: &str) -> PathBuf {
        self.record_dir(name).join(RECORD_FILE)
    }

    /// Directory holding network records.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.runtime.join("network")
    }

    /// Record file of a network.
    #[must_use]
    pub fn network(&self, name: &str) -> PathBuf {
        self.networks().join(format!("{name}.json"))
    }

    /// Subnet allocation table.
    #[must_use]
    pub fn ipam(&self) -> PathBuf {
        self.networks().join("ipam").join("subnet.json")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.records())?;
        std::fs::create_dir_all(self.networks())?;
        Ok(())
    }
}

impl Default for KegPaths {
    fn default() -> Self {
        Self {
            root: KEG_ROOT.clone(),
            runtime: KEG_RUNTIME_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = KegPaths::with_root("/tmp/keg-test");
        assert_eq!(
            paths.container_merged("web"),
            PathBuf::from("/tmp/keg-test/containers/web/merged")
        );
        assert_eq!(paths.runtime, PathBuf::from("/tmp/keg-test/run"));
        assert_eq!(
            paths.record("web"),
            PathBuf::from("/tmp/keg-test/run/containers/web/config.json")
        );
    }

    #[test]
    fn network_paths() {
        let paths = KegPaths::with_root("/k");
        assert_eq!(paths.network("br0"), PathBuf::from("/k/run/network/br0.json"));
        assert_eq!(
            paths.ipam(),
            PathBuf::from("/k/run/network/ipam/subnet.json")
        );
    }

    #[test]
    fn image_archive_order() {
        let paths = KegPaths::with_root("/k");
        let [tar, gz] = paths.image_archives("busybox");
        assert_eq!(tar, PathBuf::from("/k/images/busybox.tar"));
        assert_eq!(gz, PathBuf::from("/k/images/busybox.tar.gz"));
    }

    #[test]
    fn create_dirs_in_tempdir() {
        let temp = tempfile::tempdir().unwrap();
        let paths = KegPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        assert!(paths.images().is_dir());
        assert!(paths.records().is_dir());
        assert!(paths.networks().is_dir());
    }
}
