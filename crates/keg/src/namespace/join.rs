#![allow(unsafe_code)]
//! Joining the namespaces of a running process.

use keg_common::{KegError, KegResult};

#[cfg(target_os = "linux")]
use super::Namespace;

/// Move the calling thread into every namespace of `pid`.
///
/// All namespace files are opened up front; entering `mnt` changes what
/// `/proc` shows. Joining `pid` only affects children forked afterwards.
#[cfg(target_os = "linux")]
pub fn join_all(pid: i32) -> KegResult<()> {
    use std::fs::File;
    use std::os::fd::AsRawFd;

    let files = Namespace::JOIN_ORDER
        .iter()
        .map(|ns| File::open(ns.path(pid)).map(|file| (*ns, file)))
        .collect::<std::io::Result<Vec<_>>>()?;

    for (ns, file) in &files {
        // SAFETY: the descriptor is open for the duration of the call.
        let ret = unsafe { libc::setns(file.as_raw_fd(), 0) };
        if ret != 0 {
            let e = std::io::Error::last_os_error();
            return Err(KegError::Internal {
                message: format!("setns {ns} of {pid}: {e}"),
            });
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn join_all(_pid: i32) -> KegResult<()> {
    Err(KegError::Unsupported {
        feature: "setns".to_string(),
    })
}
