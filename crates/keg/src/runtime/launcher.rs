//! Parent side of `keg run`.
//!
//! ```text
//! Idle -> WorkspaceBuilt -> Spawned -> MetadataRecorded -> LimitsApplied
//!      -> (NetworkConnected) -> CommandSent -> Exited | Detached
//! ```
//!
//! The user command is only written to init once the cgroup and network
//! are in place, so the program never runs unconstrained.

use keg_common::{ContainerId, ContainerRecord, KegError, KegResult, RecordStore, validate_name};
use keg_network::{NetworkContext, PortMapping};

use super::config::RuntimeConfig;
use super::lifecycle::LaunchStage;
use crate::cgroup::{CgroupManager, ResourceLimits};
use crate::exec::{InitProcess, SpawnRequest, Stdio, send_signal, spawn};
use crate::filesystem::{VolumeSpec, Workspace};
use crate::namespace::NamespaceConfig;

/// Options of one `keg run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container name, the ID when absent.
    pub name: Option<String>,
    /// Image to build the workspace from.
    pub image: String,
    /// User command and arguments.
    pub command: Vec<String>,
    /// Run in the background with output to the container log.
    pub detach: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Volume specs (`host:container`).
    pub volumes: Vec<String>,
    /// Port specs (`host:container`).
    pub ports: Vec<String>,
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Network to attach to.
    pub network: Option<String>,
}

impl RunOptions {
    /// Reject malformed input before anything is built.
    fn validate(&self) -> KegResult<()> {
        if self.command.is_empty() {
            return Err(KegError::EmptyCommand);
        }
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        VolumeSpec::parse_all(&self.volumes)?;
        PortMapping::parse_all(&self.ports)?;
        if let Some(entry) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(KegError::Config {
                message: format!("environment entry {entry:?} is not KEY=VALUE"),
            });
        }
        if !self.ports.is_empty() && self.network.is_none() {
            tracing::warn!("Port mappings are ignored without --net");
        }
        Ok(())
    }
}

/// How a launch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Left running in the background.
    Detached {
        /// Container name.
        name: String,
        /// Container ID.
        id: String,
    },
    /// Foreground container finished.
    Exited {
        /// Container name.
        name: String,
        /// Exit code of the container init.
        code: i32,
    },
}

/// Resources of an in-flight launch.
struct Launch {
    name: String,
    stage: LaunchStage,
    workspace: Workspace,
    volumes: Vec<String>,
    store: RecordStore,
    cgroup: CgroupManager,
}

impl Launch {
    fn advance(&mut self, stage: LaunchStage) {
        tracing::debug!(container = %self.name, stage = %stage, "Launch stage");
        self.stage = stage;
    }

    /// Undo every stage reached so far. Best-effort.
    fn unwind(&self, process: Option<InitProcess>) {
        tracing::warn!(container = %self.name, stage = %self.stage, "Unwinding launch");
        if let Some(process) = process.filter(|_| self.stage.owns_child()) {
            process.abort();
        }
        if self.stage >= LaunchStage::MetadataRecorded {
            self.cgroup.destroy();
            if let Err(e) = self.store.delete(&self.name) {
                tracing::warn!(container = %self.name, error = %e, "Failed to delete record");
            }
        }
        self.workspace.destroy(&self.volumes, false);
    }

    /// Tear down a foreground container after it exited.
    async fn finish(&self, network: Option<&NetworkContext>, record: &mut ContainerRecord) {
        if let Some(network) = network {
            network.disconnect(record).await;
        }
        self.cgroup.destroy();
        if let Err(e) = self.store.delete(&self.name) {
            tracing::warn!(container = %self.name, error = %e, "Failed to delete record");
        }
        self.workspace.destroy(&self.volumes, false);
    }
}

/// Launch a container.
///
/// # Errors
///
/// Returns the error of the first failing stage, after unwinding what was
/// already set up.
pub async fn run(config: &RuntimeConfig, options: RunOptions) -> KegResult<LaunchOutcome> {
    options.validate()?;

    let id = ContainerId::generate();
    let name = options.name.clone().unwrap_or_else(|| id.to_string());
    let store = config.records();
    if store.exists(&name) {
        return Err(KegError::Config {
            message: format!("container {name} already exists"),
        });
    }

    let network = match &options.network {
        Some(network) => {
            let context = NetworkContext::load(&config.paths)?;
            context.get(network)?;
            Some(context)
        }
        None => None,
    };
    config.paths.create_dirs()?;

    let workspace = Workspace::new(&config.paths, &options.image, &name);
    let root = workspace.build(&config.paths, &options.volumes)?;
    let mut launch = Launch {
        name: name.clone(),
        stage: LaunchStage::Idle,
        workspace,
        volumes: options.volumes.clone(),
        cgroup: CgroupManager::new(config.cgroup_path(&name)),
        store,
    };
    launch.advance(LaunchStage::WorkspaceBuilt);

    let stdio = if options.detach {
        Stdio::Log(launch.store.log_path(&name))
    } else {
        Stdio::Inherit
    };
    let request = SpawnRequest {
        root,
        env: options.env.clone(),
        stdio,
        namespaces: NamespaceConfig::container(),
    };
    let mut process = match spawn(&request) {
        Ok(process) => process,
        Err(e) => {
            launch.unwind(None);
            return Err(e);
        }
    };
    launch.advance(LaunchStage::Spawned);

    let mut record = ContainerRecord::new(
        &id,
        &name,
        process.pid(),
        &options.image,
        &options.command,
        &options.volumes,
        &options.ports,
    );
    if let Err(e) = prepare(&mut launch, &mut process, &mut record, &options, network.as_ref()).await {
        launch.unwind(Some(process));
        return Err(e);
    }
    launch.advance(LaunchStage::CommandSent);

    if options.detach {
        launch.advance(LaunchStage::Detached);
        tracing::info!(container = %name, pid = record.pid, "Container detached");
        return Ok(LaunchOutcome::Detached {
            name,
            id: id.to_string(),
        });
    }

    let code = wait_foreground(process).await;
    launch.advance(LaunchStage::Exited);
    launch.finish(network.as_ref(), &mut record).await;
    let code = code?;
    tracing::info!(container = %name, code, "Container exited");
    Ok(LaunchOutcome::Exited { name, code })
}

/// Everything between the clone and the command hand-off.
async fn prepare(
    launch: &mut Launch,
    process: &mut InitProcess,
    record: &mut ContainerRecord,
    options: &RunOptions,
    network: Option<&NetworkContext>,
) -> KegResult<()> {
    launch.store.save(record)?;
    launch.advance(LaunchStage::MetadataRecorded);

    launch.cgroup.set_limits(&options.limits);
    launch.cgroup.apply(process.pid());
    launch.advance(LaunchStage::LimitsApplied);

    if let (Some(context), Some(network)) = (network, &options.network) {
        context.connect(network, record, &launch.store).await?;
        launch.advance(LaunchStage::NetworkConnected);
    }

    if let Err(e) = process.send_command(&options.command) {
        if let Some(context) = network {
            context.disconnect(record).await;
        }
        return Err(e);
    }
    Ok(())
}

/// Wait for a foreground container, killing it on Ctrl-C.
async fn wait_foreground(process: InitProcess) -> KegResult<i32> {
    let pid = process.pid();
    let wait = process.wait();
    tokio::pin!(wait);

    tokio::select! {
        code = &mut wait => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(pid, "Interrupted, killing container");
            if let Err(e) = send_signal(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "Failed to kill container");
            }
            wait.await
        }
    }
}
