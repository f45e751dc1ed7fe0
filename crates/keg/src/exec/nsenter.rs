//! Namespace-join hook behind `keg exec`.
//!
//! When the binary starts with both [`ENV_PID`] and [`ENV_CMD`] set, it
//! joins the namespaces of that PID, runs the command through `/bin/sh -c`
//! and exits. This runs before any thread exists: a multi-threaded
//! process cannot join a mount namespace.

use std::process::Command;

use keg_common::{KegError, KegResult};

use crate::namespace::join_all;

/// Target PID variable.
pub const ENV_PID: &str = "keg_pid";

/// Shell command variable.
pub const ENV_CMD: &str = "keg_cmd";

/// The hook's request, if the environment carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Host PID whose namespaces are joined.
    pub pid: i32,
    /// Command passed to the shell.
    pub command: String,
}

impl JoinRequest {
    /// Read the request from two variable values.
    ///
    /// Returns `None` unless both are present.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Config`] if the PID is not a number.
    pub fn from_vars(pid: Option<String>, command: Option<String>) -> KegResult<Option<Self>> {
        let (Some(pid), Some(command)) = (pid, command) else {
            return Ok(None);
        };
        let pid = pid.trim().parse().map_err(|_| KegError::Config {
            message: format!("{ENV_PID} is not a PID: {pid:?}"),
        })?;
        Ok(Some(Self { pid, command }))
    }

    fn from_env() -> KegResult<Option<Self>> {
        Self::from_vars(std::env::var(ENV_PID).ok(), std::env::var(ENV_CMD).ok())
    }

    /// Join the namespaces and run the command, returning its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if a namespace cannot be joined or the shell cannot
    /// be started.
    pub fn run(&self) -> KegResult<i32> {
        join_all(self.pid)?;
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .env_remove(ENV_PID)
            .env_remove(ENV_CMD)
            .status()?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Run the hook if requested. Returns the exit code to terminate with.
#[must_use]
pub fn hook() -> Option<i32> {
    match JoinRequest::from_env() {
        Ok(None) => None,
        Ok(Some(request)) => match request.run() {
            Ok(code) => Some(code),
            Err(e) => {
                eprintln!("keg: exec into {}: {e}", request.pid);
                Some(1)
            }
        },
        Err(e) => {
            eprintln!("keg: {e}");
            Some(1)
        }
    }
}
