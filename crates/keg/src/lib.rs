//! # Keg Container Runtime
//!
//! Keg runs a command in an isolated process tree built from Linux
//! primitives:
//!
//! - **Namespaces**: fresh UTS, IPC, network, PID and mount namespaces
//! - **Cgroup v1**: memory, CPU share and cpuset limits
//! - **OverlayFS**: a copy-on-write root over an extracted image archive,
//!   plus bind-mounted volumes
//! - **Bridge networking**: via [`keg_network`]
//!
//! ## Usage
//!
//! ```no_run
//! use keg::runtime::{LaunchOutcome, RunOptions, RuntimeConfig, run};
//!
//! # async fn example() -> keg_common::KegResult<()> {
//! let config = RuntimeConfig::default();
//! let options = RunOptions {
//!     image: "busybox".to_string(),
//!     command: vec!["top".to_string()],
//!     detach: true,
//!     ..RunOptions::default()
//! };
//!
//! if let LaunchOutcome::Detached { id, .. } = run(&config, options).await? {
//!     println!("started {id}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod runtime;

pub use runtime::{RunOptions, RuntimeConfig};
