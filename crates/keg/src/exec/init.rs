#![allow(unsafe_code)]
//! Container init: the first code to run inside the new namespaces.
//!
//! Reads the user command from [`INIT_PIPE_FD`], switches the root to the
//! merged workspace the parent left as working directory, mounts `/proc`
//! and `/dev`, then replaces itself with the user program.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use keg_common::{KegError, KegResult};

use super::spawn::INIT_PIPE_FD;
use crate::filesystem::{mount_dev_tmpfs, mount_proc, pivot_into};

/// Split a received command blob into argv.
///
/// # Errors
///
/// Returns [`KegError::EmptyCommand`] if no word is present.
pub fn parse_command(message: &str) -> KegResult<Vec<String>> {
    let argv: Vec<String> = message
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect();
    if argv.is_empty() {
        return Err(KegError::EmptyCommand);
    }
    Ok(argv)
}

/// Read the whole command from the inherited pipe.
fn read_command() -> KegResult<Vec<String>> {
    // SAFETY: the launcher hands init exactly one pipe on this slot and
    // nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(INIT_PIPE_FD) };
    let mut message = String::new();
    File::from(fd).read_to_string(&mut message)?;
    parse_command(&message)
}

/// Run container init. Only returns on failure.
///
/// # Errors
///
/// Returns an error if the command is empty, the mount namespace cannot be
/// finalized, or the executable cannot be found or executed.
pub fn container_init() -> KegResult<()> {
    let argv = read_command()?;
    tracing::debug!(command = ?argv, "Init received command");

    let root = std::env::current_dir()?;
    pivot_into(&root)?;

    for dir in ["/proc", "/dev"] {
        std::fs::create_dir_all(dir)?;
    }
    mount_proc(Path::new("/proc"))?;
    mount_dev_tmpfs(Path::new("/dev"))?;

    let path = which::which(&argv[0]).map_err(|_| KegError::ExecutableNotFound {
        command: argv[0].clone(),
    })?;
    tracing::debug!(path = %path.display(), "Executing user command");

    let err = Command::new(&path).arg0(&argv[0]).args(&argv[1..]).exec();
    Err(KegError::Internal {
        message: format!("exec {} failed: {err}", path.display()),
    })
}
