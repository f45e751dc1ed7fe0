//! Keg CLI entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use keg::cli::Cli;
use keg::exec::nsenter;

fn init_tracing(cli: &Cli) -> Result<()> {
    let level = if cli.debug { "keg=debug" } else { "keg=info" };
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);

    let json = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().json().with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(json)
        .init();
    Ok(())
}

fn main() -> Result<ExitCode> {
    // Joining a mount namespace needs a single-threaded process.
    if let Some(code) = nsenter::hook() {
        std::process::exit(code);
    }

    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if cli.is_init() {
        return Cli::init();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli.execute())
}
