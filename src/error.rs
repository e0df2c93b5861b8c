//! Domain-specific error types for the Itamae provisioner.
//!
//! This module defines `ProvisionerError`, a `thiserror`-based enum that
//! provides typed error variants for configuration, templating and execution
//! failures. The resolver and the template renderer return
//! `Result<T, ProvisionerError>`, while the execution sequencer and the
//! communicator boundary use `anyhow::Result` with step context attached.
//!
//! `ProvisionerError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at boundaries that return `anyhow::Result`.

use std::fmt;
use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// An accumulating collection of independent errors.
///
/// Configuration problems are not fail-fast: every violated rule is pushed
/// here so the user sees all of them in one pass.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ProvisionerError>,
}

impl MultiError {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one error to the collection.
    pub fn push(&mut self, err: ProvisionerError) {
        self.errors.push(err);
    }

    /// Returns true when no error has been collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns the collected errors in insertion order.
    pub fn errors(&self) -> &[ProvisionerError] {
        &self.errors
    }

    /// Converts the collection into `Ok(())` when empty, or wraps it with `wrap`.
    pub fn into_result(
        self,
        wrap: impl FnOnce(MultiError) -> ProvisionerError,
    ) -> Result<(), ProvisionerError> {
        if self.is_empty() { Ok(()) } else { Err(wrap(self)) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} error(s) occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n* {}", err)?;
        }
        Ok(())
    }
}

/// Domain-specific error type for the provisioner.
///
/// Provides typed variants for common failure modes, enabling callers
/// to match on error kinds programmatically rather than parsing error
/// message strings.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionerError {
    /// The raw configuration could not be decoded (unknown keys, bad types).
    #[error("failed to decode configuration: {0}")]
    Decode(MultiError),

    /// One or more validation rules were violated.
    #[error("invalid configuration: {0}")]
    Config(MultiError),

    /// A configuration key is not part of the schema.
    #[error("'{0}' is not a recognized configuration key")]
    UnknownKey(String),

    /// A configuration value could not be coerced to the declared type.
    #[error("'{key}' expected type '{expected}', got unconvertible type '{got}'")]
    InvalidType {
        /// Canonical configuration key.
        key: String,
        /// Declared type of the key.
        expected: &'static str,
        /// Description of the value that was supplied.
        got: String,
    },

    /// A validation constraint was violated.
    #[error("{0}")]
    Validation(String),

    /// A command template is malformed or could not be evaluated.
    #[error("template error in {name}: {message}")]
    Template {
        /// Name of the template (e.g., `execute_command`).
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// A dispatched command finished with an unacceptable exit status.
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// The remote-execution channel reported a transport-level failure.
    #[error("communicator error: {0}")]
    Communicator(String),

    /// The guest OS type has no guest command set.
    #[error("unsupported guest OS type: {0}")]
    UnsupportedOs(String),

    /// `provision` was called before a successful `prepare`.
    #[error("provisioner has not been prepared")]
    NotPrepared,

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionerError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a `Template` variant.
    pub(crate) fn template(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an `Execution` variant for a non-zero exit status.
    pub(crate) fn exit_status(command: impl Into<String>, status: i32) -> Self {
        Self::Execution {
            command: command.into(),
            status: format!(
                "non-zero exit status {}. See output above for more information",
                status
            ),
        }
    }
}
