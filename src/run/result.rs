//! Process results and runner errors.

use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Captured output of one stream: text in text mode, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Text(String),
    Bytes(Vec<u8>),
}

impl Captured {
    pub fn from_buffer(buf: Vec<u8>, text: bool) -> Self {
        if text {
            match String::from_utf8(buf) {
                Ok(s) => Captured::Text(s),
                Err(e) => Captured::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            }
        } else {
            Captured::Bytes(buf)
        }
    }

    /// Lossy text view of either form.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Captured::Text(s) => Cow::Borrowed(s),
            Captured::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Captured::Text(s) => s.as_bytes(),
            Captured::Bytes(b) => b,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub argv: Vec<String>,
    /// Exit code, or `128 + signal` when the child was killed by a signal.
    pub exit_code: i32,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        self.stdout.as_text()
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        self.stderr.as_text()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child was killed after `timeout`; `partial` holds everything it wrote.
    #[error("command {:?} timed out after {:?}", .partial.argv, .timeout)]
    Timeout {
        timeout: Duration,
        partial: Box<ProcessResult>,
    },

    #[error("command {:?} exited with code {}", .result.argv, .result.exit_code)]
    NonZeroExit { result: Box<ProcessResult> },
}

impl RunError {
    /// Output captured before the failure, when there is any.
    pub fn output(&self) -> Option<&ProcessResult> {
        match self {
            RunError::Timeout { partial, .. } => Some(partial.as_ref()),
            RunError::NonZeroExit { result } => Some(result.as_ref()),
            RunError::EmptyCommand | RunError::Spawn { .. } | RunError::Io { .. } => None,
        }
    }
}
