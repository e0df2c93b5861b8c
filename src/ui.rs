//! Progress sink for human-readable provisioning output.

use std::io::{self, Write};
use std::sync::Mutex;

/// Receives progress output while provisioning.
///
/// All methods are fire-and-forget: a sink that cannot deliver a message
/// drops it rather than failing the run.
pub trait Ui {
    /// Announces a top-level step.
    fn say(&self, message: &str);

    /// Reports a detail belonging to the current step.
    fn message(&self, message: &str);

    /// Reports error output, such as a command's stderr.
    fn error(&self, message: &str) {
        self.message(message);
    }
}

/// UI writing to a terminal-like stream.
///
/// Announcements are prefixed with `==> `, details are indented.
pub struct ConsoleUi<W: Write + Send> {
    out: Mutex<W>,
}

impl ConsoleUi<io::Stdout> {
    /// Creates a UI that writes to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleUi<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Consumes the UI and returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_line(&self, prefix: &str, message: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        for line in message.lines() {
            if let Err(e) = writeln!(out, "{}{}", prefix, line) {
                tracing::debug!("failed to write ui output: {}", e);
                return;
            }
        }
        if let Err(e) = out.flush() {
            tracing::debug!("failed to flush ui output: {}", e);
        }
    }
}

impl<W: Write + Send> Ui for ConsoleUi<W> {
    fn say(&self, message: &str) {
        self.write_line("==> ", message);
    }

    fn message(&self, message: &str) {
        self.write_line("    ", message);
    }

    fn error(&self, message: &str) {
        self.write_line("  ! ", message);
    }
}
