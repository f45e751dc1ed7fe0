//! # keg-common
//!
//! Shared utilities and types for the keg container runtime.
//!
//! This crate provides common functionality used across all keg crates:
//! - Container ID generation
//! - Standard filesystem paths
//! - Memory quantity parsing
//! - The persisted container record
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod record;
pub mod resource;

pub use error::{KegError, KegResult};
pub use id::ContainerId;
pub use paths::KegPaths;
pub use record::{ContainerRecord, ContainerStatus, RecordStore, validate_name};
pub use resource::MemoryLimit;
