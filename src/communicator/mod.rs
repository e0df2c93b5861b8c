//! Remote-execution channel abstraction.
//!
//! This module provides:
//! - [`RemoteCmd`]: one command dispatched to the channel and its exit status
//! - [`Communicator`]: trait for running commands and uploading files
//! - [`LocalCommunicator`]: implementation targeting the local machine

mod local;
mod pipe;

use std::io::Read;

use anyhow::Result;

use crate::error::ProvisionerError;
use crate::ui::Ui;

pub use local::LocalCommunicator;

/// A command dispatched to a communicator.
///
/// The exit status is only known after [`run()`](Self::run) returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCmd {
    command: String,
    exit_status: Option<i32>,
}

impl RemoteCmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_status: None,
        }
    }

    /// Returns the literal command string.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the exit status reported by the communicator, if the command has completed.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Dispatches the command and waits for its completion.
    ///
    /// Transport-level failures are returned as errors; a non-zero exit status
    /// is not an error here and must be checked by the caller.
    pub fn run(&mut self, comm: &dyn Communicator, ui: &dyn Ui) -> Result<i32> {
        let status = comm.start(self, ui)?;
        tracing::debug!(command = %self.command, status, "remote command completed");
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Runs the command and fails unless it exits with status 0.
    pub fn run_checked(&mut self, comm: &dyn Communicator, ui: &dyn Ui) -> Result<()> {
        match self.run(comm, ui)? {
            0 => Ok(()),
            status => Err(ProvisionerError::exit_status(&self.command, status).into()),
        }
    }
}

/// Trait for the channel through which the target machine is reached.
pub trait Communicator {
    /// Runs a command on the target, streaming its output to `ui`, and
    /// returns its exit status.
    fn start(&self, cmd: &RemoteCmd, ui: &dyn Ui) -> Result<i32>;

    /// Writes the content of `source` to the file `destination` on the target.
    fn upload(&self, destination: &str, source: &mut dyn Read) -> Result<()>;

    /// Copies the local directory `source` to `destination` on the target.
    ///
    /// A trailing slash on `source` copies its contents rather than the
    /// directory itself.
    fn upload_dir(&self, destination: &str, source: &str) -> Result<()>;
}
