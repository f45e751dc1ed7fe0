//! Container runtime core.
//!
//! The launcher starts containers; the container operations act on the
//! persisted records of existing ones.

pub mod container;
mod config;
mod launcher;
mod lifecycle;

pub use config::{DEFAULT_CGROUP_PARENT, RuntimeConfig};
pub use launcher::{LaunchOutcome, RunOptions, run};
pub use lifecycle::LaunchStage;
