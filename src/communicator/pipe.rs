//! Line-by-line forwarding of child process pipes.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::Sender;

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StreamType {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Extracts a human-readable message from a thread panic.
pub(super) fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Reads `pipe` until EOF and sends every complete line to `tx` as it arrives.
///
/// - the trailing LF or CRLF is stripped
/// - binary data goes through lossy UTF-8 conversion
/// - an I/O error stops reading without failing the command, whose outcome
///   is decided by its exit status alone
/// - reading also stops once the receiving side is gone
pub(super) fn forward_lines<R: Read>(
    pipe: Option<R>,
    stream_type: StreamType,
    tx: Sender<(StreamType, String)>,
) {
    let Some(pipe) = pipe else {
        tracing::error!(
            stream = %stream_type,
            "pipe was None (unexpected: Stdio::piped() was set), no output will be captured"
        );
        return;
    };

    let mut reader = BufReader::new(pipe);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break,
            Ok(_) => {
                let content = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                let text = String::from_utf8_lossy(content);
                let line = text.trim_end_matches('\r').to_string();
                if tx.send((stream_type, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(stream = %stream_type, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }
}
