//! Network namespace switching.
//!
//! The network namespace is a per-thread attribute, so configuring the
//! inside of a container happens on a dedicated OS thread that joins the
//! target namespace, drives its own single-threaded runtime and switches
//! back before it exits. Nothing else ever runs on that thread.

use std::fs::File;
use std::future::Future;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use keg_common::{KegError, KegResult};
use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};
use tokio::sync::oneshot;

use crate::link::Netlink;

/// Namespace file of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Path of the network namespace of `pid`.
#[must_use]
pub fn netns_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Switches the current thread back to its original namespace on drop.
struct Restore {
    origin: File,
}

impl Drop for Restore {
    fn drop(&mut self) {
        if let Err(e) = move_into_link_name_space(self.origin.as_fd(), Some(LinkNameSpaceType::Network)) {
            tracing::error!(error = %e, "Failed to restore original network namespace");
        }
    }
}

fn enter(target: &Path) -> KegResult<Restore> {
    let origin = File::open(THREAD_NETNS)?;
    let ns = File::open(target)?;
    move_into_link_name_space(ns.as_fd(), Some(LinkNameSpaceType::Network))
        .map_err(|e| KegError::Io(e.into()))?;
    Ok(Restore { origin })
}

/// Run `task` with a netlink handle bound to the namespace at `target`.
///
/// # Errors
///
/// Returns an error if the namespace cannot be entered, the worker thread
/// dies, or `task` itself fails.
pub async fn run_in_netns<F, Fut, T>(target: impl Into<PathBuf>, task: F) -> KegResult<T>
where
    F: FnOnce(Netlink) -> Fut + Send + 'static,
    Fut: Future<Output = KegResult<T>>,
    T: Send + 'static,
{
    let target = target.into();
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("keg-netns".to_string())
        .spawn(move || {
            let result = (|| {
                let _restore = enter(&target)?;
                tracing::debug!(netns = %target.display(), "Entered network namespace");
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(async move {
                    let netlink = Netlink::connect()?;
                    task(netlink).await
                })
            })();
            let _ = tx.send(result);
        })?;

    rx.await.map_err(|_| KegError::Internal {
        message: "network namespace worker exited without a result".to_string(),
    })?
}
