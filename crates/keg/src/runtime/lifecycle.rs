//! Launch stages.

use std::fmt;

/// How far a launch got. Stages are ordered; a failure unwinds every
/// stage reached so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaunchStage {
    /// Nothing built yet.
    Idle,
    /// Overlay and volumes are mounted.
    WorkspaceBuilt,
    /// Init is cloned and blocked on its pipe.
    Spawned,
    /// The container record is persisted.
    MetadataRecorded,
    /// The cgroup holds the init process.
    LimitsApplied,
    /// The container is attached to its network.
    NetworkConnected,
    /// The user command was written and the pipe closed.
    CommandSent,
    /// The container was left running in the background.
    Detached,
    /// The foreground container exited.
    Exited,
}

impl LaunchStage {
    /// Whether a failure at this stage still requires killing init.
    #[must_use]
    pub fn owns_child(self) -> bool {
        self >= Self::Spawned && self < Self::CommandSent
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WorkspaceBuilt => write!(f, "workspace-built"),
            Self::Spawned => write!(f, "spawned"),
            Self::MetadataRecorded => write!(f, "metadata-recorded"),
            Self::LimitsApplied => write!(f, "limits-applied"),
            Self::NetworkConnected => write!(f, "network-connected"),
            Self::CommandSent => write!(f, "command-sent"),
            Self::Detached => write!(f, "detached"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(LaunchStage::Idle < LaunchStage::WorkspaceBuilt);
        assert!(LaunchStage::LimitsApplied < LaunchStage::NetworkConnected);
        assert!(LaunchStage::NetworkConnected < LaunchStage::CommandSent);
    }

    #[test]
    fn child_is_owned_until_command_is_sent() {
        assert!(!LaunchStage::WorkspaceBuilt.owns_child());
        assert!(LaunchStage::Spawned.owns_child());
        assert!(LaunchStage::NetworkConnected.owns_child());
        assert!(!LaunchStage::CommandSent.owns_child());
    }
}
