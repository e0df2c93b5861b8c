use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    disable_version_flag = true,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Print the version banner and exit
    #[arg(short = 'v', long, action = ArgAction::SetTrue)]
    pub version: bool,

    /// Set the log level
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the provisioner to Packer over stdio (the default)
    Serve,

    /// Print the version banner
    Version,

    /// Validate the given YAML configuration
    Validate(ValidateArgs),

    /// Provision the local machine with the given YAML configuration
    Apply(ApplyArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file holding the provisioner configuration
    #[arg(short, long, default_value = "itamae.yaml")]
    pub file: Utf8PathBuf,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Path to the YAML file holding the provisioner configuration
    #[arg(short, long, default_value = "itamae.yaml")]
    pub file: Utf8PathBuf,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate.
/// Logs are always written to stderr, since stdout carries the plugin
/// protocol when serving.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
