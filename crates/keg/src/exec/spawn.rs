#![allow(unsafe_code)]
//! Spawning the container init in fresh namespaces.
//!
//! The parent prepares every C string and descriptor, then `clone3`s a
//! child that only wires descriptors, changes into the container root and
//! `execve`s `/proc/self/exe init`. The user command follows later over
//! the pipe on descriptor [`INIT_PIPE_FD`].

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use keg_common::{KegError, KegResult};

use crate::namespace::NamespaceConfig;

/// Descriptor the init process reads its command from.
pub const INIT_PIPE_FD: i32 = 3;

/// Hidden sub-command selecting the init bootstrap mode.
pub const INIT_COMMAND: &str = "init";

const SELF_EXE: &str = "/proc/self/exe";

/// Where the container's standard streams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stdio {
    /// Inherit the caller's terminal.
    Inherit,
    /// stdout/stderr appended to a log file, stdin from `/dev/null`.
    Log(PathBuf),
}

/// Everything needed to start a container init.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Merged root the child starts in.
    pub root: PathBuf,
    /// Extra `KEY=VALUE` entries appended to the inherited environment.
    pub env: Vec<String>,
    /// Stream wiring.
    pub stdio: Stdio,
    /// Namespaces to create.
    pub namespaces: NamespaceConfig,
}

/// A spawned init process waiting for its command.
#[derive(Debug)]
pub struct InitProcess {
    pid: i32,
    writer: Option<File>,
}

impl InitProcess {
    /// Host PID of the child.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Hand the user command to init and close the pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the command was already sent or the write fails.
    pub fn send_command(&mut self, command: &[String]) -> KegResult<()> {
        let mut writer = self.writer.take().ok_or_else(|| KegError::Internal {
            message: "init command already sent".to_string(),
        })?;
        let message = command.join(" ");
        tracing::debug!(pid = self.pid, command = %message, "Sending command to init");
        writer.write_all(message.as_bytes())?;
        Ok(())
    }

    /// Kill the child and reap it.
    pub fn abort(mut self) {
        self.writer = None;
        if let Err(e) = send_signal(self.pid, libc::SIGKILL) {
            tracing::warn!(pid = self.pid, error = %e, "Failed to kill init");
        }
        if let Err(e) = wait_pid(self.pid) {
            tracing::warn!(pid = self.pid, error = %e, "Failed to reap init");
        }
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// A signal death maps to `128 + signo`.
    ///
    /// # Errors
    ///
    /// Returns an error if `waitpid` fails.
    pub async fn wait(mut self) -> KegResult<i32> {
        self.writer = None;
        let pid = self.pid;
        tokio::task::spawn_blocking(move || wait_pid(pid))
            .await
            .map_err(|e| KegError::Internal {
                message: format!("Task join error: {e}"),
            })?
    }
}

/// Send `signal` to `pid`.
///
/// # Errors
///
/// Returns the `kill(2)` error, e.g. `ESRCH` for a process that is gone.
pub fn send_signal(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn wait_pid(pid: i32) -> KegResult<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let result = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if result != -1 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(KegError::Internal {
                message: format!("waitpid failed: {err}"),
            });
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(1)
    }
}

/// `struct clone_args` from `linux/sched.h`.
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Descriptors and strings the child touches, all built before the clone.
struct Prepared {
    exe: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    root: CString,
    reader: OwnedFd,
    stdin: Option<File>,
    log: Option<File>,
}

fn c_string(bytes: Vec<u8>) -> KegResult<CString> {
    CString::new(bytes).map_err(|e| KegError::Config {
        message: format!("argument contains a NUL byte: {e}"),
    })
}

impl Prepared {
    fn new(request: &SpawnRequest, reader: OwnedFd) -> KegResult<Self> {
        let mut envp = std::env::vars_os()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend(value.into_vec());
                c_string(entry)
            })
            .collect::<KegResult<Vec<_>>>()?;
        for entry in &request.env {
            envp.push(c_string(entry.clone().into_bytes())?);
        }

        let (stdin, log) = match &request.stdio {
            Stdio::Inherit => (None, None),
            Stdio::Log(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                (Some(File::open("/dev/null")?), Some(log))
            }
        };

        Ok(Self {
            exe: c_string(SELF_EXE.into())?,
            argv: vec![c_string("keg".into())?, c_string(INIT_COMMAND.into())?],
            envp,
            root: c_string(request.root.as_os_str().as_bytes().to_vec())?,
            reader,
            stdin,
            log,
        })
    }
}

/// Null-terminated pointer array over `strings`.
fn pointers(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Clone a child into new namespaces running `keg init`.
///
/// # Errors
///
/// Returns [`KegError::PermissionDenied`] without the privilege to create
/// namespaces, or an error if preparing the child fails.
#[cfg(target_os = "linux")]
pub fn spawn(request: &SpawnRequest) -> KegResult<InitProcess> {
    use rustix::pipe::{PipeFlags, pipe_with};

    let (reader, writer) = pipe_with(PipeFlags::CLOEXEC).map_err(|e| KegError::Io(e.into()))?;
    let prepared = Prepared::new(request, reader)?;
    let argv = pointers(&prepared.argv);
    let envp = pointers(&prepared.envp);

    let args = CloneArgs {
        flags: request.namespaces.clone_flags(),
        exit_signal: u64::from(libc::SIGCHLD.unsigned_abs()),
        ..CloneArgs::default()
    };

    // SAFETY: `args` is a valid clone_args of the size passed. With no
    // stack given the child continues on a copy of this stack.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &raw const args,
            std::mem::size_of::<CloneArgs>(),
        )
    };

    if ret == 0 {
        // SAFETY: in the child, only async-signal-safe calls over data
        // prepared before the clone.
        unsafe { exec_init(&prepared, &argv, &envp) }
    }
    if ret == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(KegError::PermissionDenied {
                operation: "create namespaces".to_string(),
            });
        }
        return Err(KegError::Io(err));
    }

    let pid = i32::try_from(ret).map_err(|_| KegError::Internal {
        message: format!("clone3 returned {ret}"),
    })?;
    drop(prepared);

    tracing::info!(pid, root = %request.root.display(), "Container init spawned");
    Ok(InitProcess {
        pid,
        writer: Some(File::from(writer)),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn spawn(_request: &SpawnRequest) -> KegResult<InitProcess> {
    Err(KegError::Unsupported {
        feature: "namespaces".to_string(),
    })
}

/// Child side of the clone. Never returns.
#[cfg(target_os = "linux")]
unsafe fn exec_init(
    prepared: &Prepared,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    unsafe {
        if let (Some(stdin), Some(log)) = (&prepared.stdin, &prepared.log) {
            if libc::dup2(stdin.as_raw_fd(), libc::STDIN_FILENO) == -1
                || libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO) == -1
                || libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) == -1
            {
                libc::_exit(126);
            }
        }

        let reader = prepared.reader.as_raw_fd();
        let wired = if reader == INIT_PIPE_FD {
            libc::fcntl(reader, libc::F_SETFD, 0)
        } else {
            libc::dup2(reader, INIT_PIPE_FD)
        };
        if wired == -1 || libc::chdir(prepared.root.as_ptr()) == -1 {
            libc::_exit(126);
        }

        libc::execve(prepared.exe.as_ptr(), argv.as_ptr(), envp.as_ptr());
        libc::_exit(127)
    }
}
