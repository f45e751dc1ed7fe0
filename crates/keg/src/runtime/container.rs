//! Operations on existing containers.

use std::path::PathBuf;

use keg_common::{ContainerRecord, ContainerStatus, KegError, KegResult};
use keg_network::NetworkContext;

use super::config::RuntimeConfig;
use crate::cgroup::CgroupManager;
use crate::exec::nsenter::{ENV_CMD, ENV_PID};
use crate::exec::send_signal;
use crate::filesystem::{Workspace, image};

/// Send SIGTERM to a running container and mark it stopped.
///
/// The signal is fire-and-forget: a process that is already gone is
/// logged, and the record is rewritten either way.
///
/// # Errors
///
/// Returns [`KegError::InvalidState`] for a stopped container, or an error
/// if the record cannot be loaded or saved.
pub fn stop(config: &RuntimeConfig, name: &str) -> KegResult<ContainerRecord> {
    let store = config.records();
    let mut record = store.load(name)?;
    if record.status == ContainerStatus::Stopped {
        return Err(KegError::InvalidState {
            name: name.to_string(),
            status: record.status.to_string(),
            operation: "stop".to_string(),
        });
    }

    if record.pid > 0 {
        match send_signal(record.pid, libc::SIGTERM) {
            Ok(()) => tracing::info!(container = %name, pid = record.pid, "Sent SIGTERM"),
            Err(e) => tracing::warn!(container = %name, pid = record.pid, error = %e, "Failed to signal container"),
        }
    }

    record.mark_stopped();
    store.save(&record)?;
    Ok(record)
}

/// Remove a stopped container: network, cgroup, workspace and record.
///
/// Everything but the record lookup is best-effort. The image layer is
/// removed only when no other container record uses the same image.
///
/// # Errors
///
/// Returns [`KegError::ContainerNotFound`] for an unknown name, or
/// [`KegError::InvalidState`] unless the container is stopped.
pub async fn remove(config: &RuntimeConfig, name: &str) -> KegResult<()> {
    let store = config.records();
    let mut record = store.load(name)?;
    if record.status != ContainerStatus::Stopped {
        return Err(KegError::InvalidState {
            name: name.to_string(),
            status: record.status.to_string(),
            operation: "remove".to_string(),
        });
    }

    if record.ip.is_some() {
        match NetworkContext::load(&config.paths) {
            Ok(network) => network.disconnect(&mut record).await,
            Err(e) => tracing::warn!(container = %name, error = %e, "Failed to load networks"),
        }
    }

    CgroupManager::new(config.cgroup_path(name)).destroy();
    let remove_lower = !image_in_use(config, &record);
    Workspace::new(&config.paths, &record.image, name).destroy(&record.volume, remove_lower);
    store.delete(name)?;

    tracing::info!(container = %name, "Container removed");
    Ok(())
}

/// Whether a container other than `record` was built from the same image.
/// An unreadable store counts as in use.
fn image_in_use(config: &RuntimeConfig, record: &ContainerRecord) -> bool {
    match config.records().list() {
        Ok(records) => {
            let users: Vec<String> = records
                .into_iter()
                .filter(|other| other.name != record.name && other.image == record.image)
                .map(|other| other.name)
                .collect();
            if !users.is_empty() {
                tracing::debug!(image = %record.image, containers = ?users, "Keeping shared image layer");
            }
            !users.is_empty()
        }
        Err(e) => {
            tracing::warn!(image = %record.image, error = %e, "Cannot list containers, keeping image layer");
            true
        }
    }
}

/// All container records, oldest first.
///
/// # Errors
///
/// Returns an error if the record directory cannot be read.
pub fn list(config: &RuntimeConfig) -> KegResult<Vec<ContainerRecord>> {
    config.records().list()
}

/// The log of a detached container.
///
/// # Errors
///
/// Returns [`KegError::ContainerNotFound`] for an unknown name, or an error
/// if the log cannot be read.
pub fn logs(config: &RuntimeConfig, name: &str) -> KegResult<String> {
    let store = config.records();
    store.load(name)?;
    let path = store.log_path(name);
    match std::fs::read_to_string(&path) {
        Ok(log) => Ok(log),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KegError::Config {
            message: format!("container {name} has no log; only detached containers are logged"),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Run `command` inside a running container and return its exit code.
///
/// Re-executes this binary with the namespace-join variables set, so the
/// join happens in a fresh single-threaded process.
///
/// # Errors
///
/// Returns an error if the container is not running or the helper cannot
/// be started.
pub async fn exec(config: &RuntimeConfig, name: &str, command: &[String]) -> KegResult<i32> {
    let record = config.records().load(name)?;
    if record.status != ContainerStatus::Running || record.pid <= 0 {
        return Err(KegError::InvalidState {
            name: name.to_string(),
            status: record.status.to_string(),
            operation: "exec".to_string(),
        });
    }
    if command.is_empty() {
        return Err(KegError::EmptyCommand);
    }

    let command = command.join(" ");
    tracing::debug!(container = %name, pid = record.pid, command = %command, "Exec into container");

    let status = tokio::process::Command::new("/proc/self/exe")
        .arg("exec")
        .env(ENV_PID, record.pid.to_string())
        .env(ENV_CMD, &command)
        .status()
        .await?;
    Ok(status.code().unwrap_or(1))
}

/// Archive a container's root as `images/<image>.tar.gz`.
///
/// # Errors
///
/// Returns an error if the container is unknown, its root is missing or the
/// archive cannot be written.
pub fn commit(config: &RuntimeConfig, name: &str, image_name: &str) -> KegResult<PathBuf> {
    let record = config.records().load(name)?;
    let root = config.paths.container_merged(&record.name);
    let [_, archive] = config.paths.image_archives(image_name);
    image::commit(&root, &archive)?;
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_common::ContainerId;
    use tempfile::{TempDir, tempdir};

    fn add_record(config: &RuntimeConfig, name: &str, status: ContainerStatus) {
        let mut record = ContainerRecord::new(
            &ContainerId::generate(),
            name,
            -1,
            "busybox",
            &["top".to_string()],
            &[],
            &[],
        );
        record.status = status;
        config.records().save(&record).unwrap();
    }

    fn setup(status: ContainerStatus) -> (TempDir, RuntimeConfig) {
        let temp = tempdir().unwrap();
        let config = RuntimeConfig::default().with_root(temp.path());
        add_record(&config, "web", status);
        (temp, config)
    }

    #[test]
    fn stop_marks_stopped() {
        let (_temp, config) = setup(ContainerStatus::Running);
        let record = stop(&config, "web").unwrap();
        assert_eq!(record.status, ContainerStatus::Stopped);
        assert_eq!(record.pid, -1);

        let stored = config.records().load("web").unwrap();
        assert_eq!(stored.status, ContainerStatus::Stopped);
        assert!(matches!(stop(&config, "web"), Err(KegError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn remove_requires_stopped() {
        let (_temp, config) = setup(ContainerStatus::Running);
        assert!(matches!(
            remove(&config, "web").await,
            Err(KegError::InvalidState { .. })
        ));
        assert!(config.records().exists("web"));
    }

    #[test_log::test(tokio::test)]
    async fn remove_deletes_record_and_workspace() {
        let (_temp, config) = setup(ContainerStatus::Stopped);
        std::fs::create_dir_all(config.paths.container_diff("web")).unwrap();

        remove(&config, "web").await.unwrap();
        assert!(!config.records().exists("web"));
        assert!(!config.paths.container("web").exists());

        assert!(matches!(
            remove(&config, "web").await,
            Err(KegError::ContainerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn shared_image_layer_survives_until_last_user() {
        let (_temp, config) = setup(ContainerStatus::Stopped);
        add_record(&config, "db", ContainerStatus::Running);
        let layer = config.paths.image_layer("busybox");
        std::fs::create_dir_all(layer.join("bin")).unwrap();

        remove(&config, "web").await.unwrap();
        assert!(layer.exists());

        stop(&config, "db").unwrap();
        remove(&config, "db").await.unwrap();
        assert!(!layer.exists());
    }

    #[test]
    fn logs_of_foreground_container() {
        let (_temp, config) = setup(ContainerStatus::Running);
        assert!(matches!(logs(&config, "web"), Err(KegError::Config { .. })));

        std::fs::write(config.records().log_path("web"), "hello\n").unwrap();
        assert_eq!(logs(&config, "web").unwrap(), "hello\n");
        assert!(matches!(logs(&config, "db"), Err(KegError::ContainerNotFound { .. })));
    }

    #[tokio::test]
    async fn exec_requires_running() {
        let (_temp, config) = setup(ContainerStatus::Stopped);
        assert!(matches!(
            exec(&config, "web", &["ls".to_string()]).await,
            Err(KegError::InvalidState { .. })
        ));
    }

    #[test]
    fn commit_writes_archive() {
        let (_temp, config) = setup(ContainerStatus::Running);
        let merged = config.paths.container_merged("web");
        std::fs::create_dir_all(merged.join("etc")).unwrap();
        std::fs::write(merged.join("etc/motd"), "hi").unwrap();

        let archive = commit(&config, "web", "snapshot").unwrap();
        assert_eq!(archive, config.paths.images().join("snapshot.tar.gz"));
        assert!(archive.is_file());
    }
}
