pub mod cli;
pub mod communicator;
pub mod config;
pub mod error;
pub mod guest;
pub mod path;
pub mod provisioner;
pub mod retry;
pub mod server;
pub mod template;
pub mod ui;
pub mod version;

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::communicator::Communicator;
use crate::provisioner::Provisioner;
use crate::ui::Ui;

/// Installs the global tracing subscriber.
///
/// Logs go to stderr; stdout is reserved for the plugin protocol.
pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(filter)
            .with_writer(io::stderr)
            .finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Serves the provisioner to the host over stdio until the host disconnects.
pub fn run_serve() -> Result<()> {
    server::run_stdio(Provisioner::new())
}

/// Resolves a configuration file and reports the result.
pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let fragments = config::load_fragments(&opts.file)?;
    let mut provisioner = Provisioner::new();
    provisioner
        .prepare(&fragments)
        .context("configuration validation failed")?;
    info!("validation successful:\n{:#?}", provisioner.config());
    Ok(())
}

/// Resolves a configuration file and provisions through `comm`.
pub fn run_apply(opts: &cli::ApplyArgs, comm: &dyn Communicator, ui: &dyn Ui) -> Result<()> {
    let fragments = config::load_fragments(&opts.file)
        .with_context(|| format!("failed to load configuration from {}", opts.file))?;
    let mut provisioner = Provisioner::new();
    provisioner
        .prepare(&fragments)
        .context("configuration validation failed")?;

    if opts.dry_run {
        info!("dry run: commands are logged but not executed");
    }
    provisioner.provision(ui, comm)
}

/// Writes the completion script for `shell` to `out`.
pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = cli::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, out);
}
