//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use color_eyre::eyre::{Result, WrapErr};
use keg_common::{ContainerRecord, MemoryLimit};
use keg_network::{NetworkContext, NetworkRecord};
use tabled::{Table, Tabled};

use crate::cgroup::ResourceLimits;
use crate::exec::container_init;
use crate::runtime::{self, LaunchOutcome, RunOptions, RuntimeConfig, container};

/// Keg - Minimal Container Runtime
#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for keg data (runtime state goes to <root>/run)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create and run a container
    Run {
        /// Keep the container attached to this terminal
        #[arg(short = 't', long, conflicts_with = "detach")]
        tty: bool,

        /// Run the container in the background
        #[arg(short, long)]
        detach: bool,

        /// Container name
        #[arg(long)]
        name: Option<String>,

        /// Memory limit (e.g. 100m)
        #[arg(short, long)]
        memory: Option<MemoryLimit>,

        /// CPU shares
        #[arg(long)]
        cpushare: Option<u64>,

        /// CPUs the container may use (e.g. 0-1)
        #[arg(long)]
        cpuset: Option<String>,

        /// Bind mount a volume (host:container)
        #[arg(short, long)]
        volume: Vec<String>,

        /// Publish a port (host:container)
        #[arg(short, long)]
        publish: Vec<String>,

        /// Set an environment variable (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Network to connect the container to
        #[arg(long)]
        net: Option<String>,

        /// Image to run
        image: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Container init (internal)
    #[command(hide = true)]
    Init,

    /// Run a command in a running container
    Exec {
        /// Container name
        name: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// List containers
    Ps,

    /// Print the log of a detached container
    Logs {
        /// Container name
        name: String,
    },

    /// Stop a running container
    Stop {
        /// Container name
        name: String,
    },

    /// Remove a stopped container
    Rm {
        /// Container name
        name: String,
    },

    /// Save a container's filesystem as an image archive
    Commit {
        /// Container name
        name: String,

        /// Image name
        image: String,
    },

    /// Manage networks
    Network {
        /// Network subcommand.
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Network commands.
#[derive(Subcommand)]
pub enum NetworkCommands {
    /// Create a network
    Create {
        /// Network driver
        #[arg(long, default_value = "bridge")]
        driver: String,

        /// Subnet in CIDR notation
        #[arg(long)]
        subnet: String,

        /// Network name
        name: String,
    },

    /// List networks
    #[command(alias = "ls")]
    List,

    /// Remove a network
    #[command(alias = "rm")]
    Remove {
        /// Network name
        name: String,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<ContainerRecord> for ContainerRow {
    fn from(record: ContainerRecord) -> Self {
        Self {
            id: record.id.chars().take(12).collect(),
            name: record.name,
            pid: record.pid,
            status: record.status.to_string(),
            command: record.command,
            created: record.create_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
struct NetworkRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "IPRANGE")]
    ip_range: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
}

impl From<&NetworkRecord> for NetworkRow {
    fn from(record: &NetworkRecord) -> Self {
        Self {
            name: record.name.clone(),
            ip_range: record.ip_range.to_string(),
            driver: record.driver.clone(),
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

impl Cli {
    /// Runtime configuration from the global options.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        match &self.root {
            Some(root) => RuntimeConfig::default().with_root(root),
            None => RuntimeConfig::default(),
        }
    }

    /// Whether this invocation is the container init bootstrap.
    #[must_use]
    pub const fn is_init(&self) -> bool {
        matches!(self.command, Commands::Init)
    }

    /// Run container init. Only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns the init failure.
    pub fn init() -> Result<ExitCode> {
        container_init().wrap_err("Container init failed")?;
        Ok(ExitCode::FAILURE)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the failing operation's error with context.
    pub async fn execute(self) -> Result<ExitCode> {
        let config = self.config();

        match self.command {
            Commands::Run {
                tty: _,
                detach,
                name,
                memory,
                cpushare,
                cpuset,
                volume,
                publish,
                env,
                net,
                image,
                command,
            } => {
                let options = RunOptions {
                    name,
                    image,
                    command,
                    detach,
                    limits: ResourceLimits {
                        memory,
                        cpu_shares: cpushare,
                        cpuset,
                    },
                    volumes: volume,
                    ports: publish,
                    env,
                    network: net,
                };

                match runtime::run(&config, options)
                    .await
                    .wrap_err("Failed to run container")?
                {
                    LaunchOutcome::Detached { id, .. } => {
                        println!("{id}");
                        Ok(ExitCode::SUCCESS)
                    }
                    LaunchOutcome::Exited { code, .. } => Ok(exit_code(code)),
                }
            }

            Commands::Init => Self::init(),

            Commands::Exec { name, command } => {
                let code = container::exec(&config, &name, &command)
                    .await
                    .wrap_err_with(|| format!("Failed to exec into {name}"))?;
                Ok(exit_code(code))
            }

            Commands::Ps => {
                let records = container::list(&config).wrap_err("Failed to list containers")?;
                let rows: Vec<ContainerRow> = records.into_iter().map(ContainerRow::from).collect();
                println!("{}", Table::new(rows));
                Ok(ExitCode::SUCCESS)
            }

            Commands::Logs { name } => {
                let log = container::logs(&config, &name)
                    .wrap_err_with(|| format!("Failed to read logs of {name}"))?;
                print!("{log}");
                Ok(ExitCode::SUCCESS)
            }

            Commands::Stop { name } => {
                container::stop(&config, &name).wrap_err_with(|| format!("Failed to stop {name}"))?;
                println!("{name}");
                Ok(ExitCode::SUCCESS)
            }

            Commands::Rm { name } => {
                container::remove(&config, &name)
                    .await
                    .wrap_err_with(|| format!("Failed to remove {name}"))?;
                println!("{name}");
                Ok(ExitCode::SUCCESS)
            }

            Commands::Commit { name, image } => {
                let archive = container::commit(&config, &name, &image)
                    .wrap_err_with(|| format!("Failed to commit {name}"))?;
                println!("{}", archive.display());
                Ok(ExitCode::SUCCESS)
            }

            Commands::Network { command } => {
                let mut networks =
                    NetworkContext::load(&config.paths).wrap_err("Failed to load networks")?;
                match command {
                    NetworkCommands::Create {
                        driver,
                        subnet,
                        name,
                    } => {
                        config.paths.create_dirs()?;
                        let record = networks
                            .create_network(&name, &driver, &subnet)
                            .await
                            .wrap_err_with(|| format!("Failed to create network {name}"))?;
                        println!("{} {}", record.name, record.ip_range);
                    }
                    NetworkCommands::List => {
                        let rows: Vec<NetworkRow> = networks.list().map(NetworkRow::from).collect();
                        println!("{}", Table::new(rows));
                    }
                    NetworkCommands::Remove { name } => {
                        networks
                            .remove_network(&name)
                            .await
                            .wrap_err_with(|| format!("Failed to remove network {name}"))?;
                        println!("{name}");
                    }
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Completions { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "keg", &mut std::io::stdout());
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run() {
        let cli = Cli::try_parse_from([
            "keg", "run", "-d", "--name", "web", "-m", "100m", "-v", "/tmp/a:/a", "-p",
            "8080:80", "--net", "testbr", "busybox", "top", "-b",
        ])
        .unwrap();
        let Commands::Run {
            detach,
            name,
            memory,
            volume,
            publish,
            net,
            image,
            command,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(detach);
        assert_eq!(name.as_deref(), Some("web"));
        assert_eq!(memory.unwrap().bytes(), 100 * 1024 * 1024);
        assert_eq!(volume, ["/tmp/a:/a"]);
        assert_eq!(publish, ["8080:80"]);
        assert_eq!(net.as_deref(), Some("testbr"));
        assert_eq!(image, "busybox");
        assert_eq!(command, ["top", "-b"]);
    }

    #[test]
    fn tty_conflicts_with_detach() {
        assert!(Cli::try_parse_from(["keg", "run", "-t", "-d", "busybox", "sh"]).is_err());
    }

    #[test]
    fn bad_memory_is_rejected() {
        assert!(Cli::try_parse_from(["keg", "run", "-m", "lots", "busybox", "sh"]).is_err());
    }

    #[test]
    fn init_is_detected() {
        let cli = Cli::try_parse_from(["keg", "init"]).unwrap();
        assert!(cli.is_init());
    }

    #[test]
    fn root_relocates_state() {
        let cli = Cli::try_parse_from(["keg", "--root", "/tmp/keg", "ps"]).unwrap();
        let config = cli.config();
        assert_eq!(config.paths.root, PathBuf::from("/tmp/keg"));
        assert_eq!(config.paths.runtime, PathBuf::from("/tmp/keg/run"));
    }

    #[test]
    fn network_create() {
        let cli = Cli::try_parse_from([
            "keg", "network", "create", "--subnet", "172.24.0.0/24", "testbr",
        ])
        .unwrap();
        let Commands::Network {
            command: NetworkCommands::Create { driver, subnet, name },
        } = cli.command
        else {
            panic!("expected network create");
        };
        assert_eq!(driver, "bridge");
        assert_eq!(subnet, "172.24.0.0/24");
        assert_eq!(name, "testbr");
    }
}
