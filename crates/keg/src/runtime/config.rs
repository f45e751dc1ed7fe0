//! Runtime configuration.

use std::path::PathBuf;

use keg_common::{KegPaths, RecordStore};

/// Default parent of every container's cgroup.
pub const DEFAULT_CGROUP_PARENT: &str = "keg";

/// Runtime configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Paths for images, layers and runtime state.
    pub paths: KegPaths,
    /// Cgroup under which container groups are created.
    pub cgroup_parent: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: KegPaths::new(),
            cgroup_parent: DEFAULT_CGROUP_PARENT.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = KegPaths::with_root(root);
        self
    }

    /// Set the cgroup parent.
    #[must_use]
    pub fn with_cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.cgroup_parent = parent.into();
        self
    }

    /// Cgroup path of a container, relative to each hierarchy's mount.
    #[must_use]
    pub fn cgroup_path(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.cgroup_parent).join(name)
    }

    /// Store of container records.
    #[must_use]
    pub fn records(&self) -> RecordStore {
        RecordStore::new(self.paths.records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.cgroup_parent, "keg");
        assert_eq!(config.cgroup_path("web"), PathBuf::from("keg/web"));
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_cgroup_parent("ci");

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.cgroup_path("job"), PathBuf::from("ci/job"));
        assert_eq!(
            config.records().record_path("job"),
            PathBuf::from("/custom/root/run/containers/job/config.json")
        );
    }
}
