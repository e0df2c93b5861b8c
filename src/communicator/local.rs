//! Communicator targeting the local machine.
//!
//! Commands run through `sh -c`; uploads are plain filesystem copies. This is
//! what `apply` uses to provision the machine the binary runs on.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use camino::Utf8Path;
use tracing::{debug, error, info};
use walkdir::WalkDir;
use which::which;

use super::pipe::{StreamType, forward_lines, panic_message};
use super::{Communicator, RemoteCmd};
use crate::error::ProvisionerError;
use crate::ui::Ui;

/// Communicator running commands on the local machine.
///
/// When `dry_run` is true, commands and uploads are logged but not
/// performed, and every command reports exit status 0.
#[derive(Debug, Default, Clone)]
pub struct LocalCommunicator {
    pub dry_run: bool,
}

impl LocalCommunicator {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl Communicator for LocalCommunicator {
    fn start(&self, cmd: &RemoteCmd, ui: &dyn Ui) -> Result<i32> {
        if self.dry_run {
            info!("dry run: {}", cmd.command());
            return Ok(0);
        }

        let shell = which("sh").context("command not found: sh")?;
        debug!("running through {}: {}", shell.display(), cmd.command());

        let mut child = Command::new(shell)
            .arg("-c")
            .arg(cmd.command())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn command `{}`", cmd.command()))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (tx, rx) = mpsc::channel();

        let stdout_tx = tx.clone();
        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || forward_lines(stdout_pipe, StreamType::Stdout, stdout_tx))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(execution_error(cmd, format!("failed to spawn stdout reader thread: {}", e)));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || forward_lines(stderr_pipe, StreamType::Stderr, tx))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(execution_error(cmd, format!("failed to spawn stderr reader thread: {}", e)));
            }
        };

        // Ends once both readers reach EOF and drop their senders.
        for (stream_type, line) in rx {
            match stream_type {
                StreamType::Stdout => ui.message(&line),
                StreamType::Stderr => ui.error(&line),
            }
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(execution_error(cmd, format!("failed to wait for command: {}", e)));
            }
        };

        let mut panicked_streams = Vec::new();
        let handles = [(StreamType::Stdout, stdout_handle), (StreamType::Stderr, stderr_handle)];
        for (stream_type, handle) in handles {
            if let Err(e) = handle.join() {
                let msg = panic_message(&*e);
                error!(stream = %stream_type, panic = msg, "reader thread panicked");
                panicked_streams.push(format!("{}: {}", stream_type, msg));
            }
        }
        if !panicked_streams.is_empty() {
            return Err(execution_error(
                cmd,
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        status.code().ok_or_else(|| {
            execution_error(cmd, "process exited without status (possibly killed by signal)".to_string())
        })
    }

    fn upload(&self, destination: &str, source: &mut dyn Read) -> Result<()> {
        if self.dry_run {
            info!("dry run: upload to {}", destination);
            return Ok(());
        }

        let destination = Utf8Path::new(destination);
        if let Some(parent) = destination.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| ProvisionerError::io(format!("failed to create {}", parent), e))?;
        }
        let mut file = fs::File::create(destination)
            .map_err(|e| ProvisionerError::io(format!("failed to create {}", destination), e))?;
        io::copy(source, &mut file)
            .map_err(|e| ProvisionerError::io(format!("failed to write {}", destination), e))?;
        Ok(())
    }

    fn upload_dir(&self, destination: &str, source: &str) -> Result<()> {
        if self.dry_run {
            info!("dry run: upload directory {} to {}", source, destination);
            return Ok(());
        }

        let source_path = Path::new(source);
        let target_root = if source.ends_with('/') {
            Path::new(destination).to_path_buf()
        } else {
            let name = source_path
                .file_name()
                .with_context(|| format!("source directory has no name: {}", source))?;
            Path::new(destination).join(name)
        };

        for entry in WalkDir::new(source_path).follow_links(true) {
            let entry = entry.with_context(|| format!("failed to walk {}", source))?;
            let relative = entry
                .path()
                .strip_prefix(source_path)
                .with_context(|| format!("unexpected path under {}", source))?;
            let target = target_root.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| {
                    ProvisionerError::io(format!("failed to create {}", target.display()), e)
                })?;
            } else {
                debug!("copying {} to {}", entry.path().display(), target.display());
                fs::copy(entry.path(), &target).map_err(|e| {
                    ProvisionerError::io(
                        format!("failed to copy {} to {}", entry.path().display(), target.display()),
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

fn execution_error(cmd: &RemoteCmd, status: String) -> anyhow::Error {
    ProvisionerError::Execution {
        command: cmd.command().to_string(),
        status,
    }
    .into()
}

/// Kills the child, reaps it, then joins the reader threads.
///
/// Best effort: failures are logged and otherwise ignored.
fn cleanup_child_process<const N: usize>(child: &mut Child, handles: [JoinHandle<()>; N]) {
    if let Err(e) = child.kill() {
        debug!("failed to kill child process: {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("failed to reap child process: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            error!(panic = panic_message(&*e), "reader thread panicked during cleanup");
        }
    }
}
