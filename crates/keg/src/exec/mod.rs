//! Process execution.

pub mod init;
pub mod nsenter;
pub mod spawn;

pub use init::container_init;
pub use spawn::{InitProcess, SpawnRequest, Stdio, send_signal, spawn};
