//! Container filesystems.
//!
//! This module handles:
//! - Image extraction and commits
//! - The per-container OverlayFS workspace and its volumes
//! - Mount operations
//! - pivot_root

pub mod image;
mod mounts;
mod overlay;
mod pivot;
mod volume;
mod workspace;

pub use mounts::{Unmounted, mount_dev_tmpfs, mount_proc, unmount};
pub use overlay::OverlayFs;
pub use pivot::pivot_into;
pub use volume::VolumeSpec;
pub use workspace::Workspace;
