use std::io;
use thiserror::Error;

/// Errors reported by a [`ProcessHandle`](crate::executor::ProcessHandle).
///
/// Failures on a background context are stored on the handle and handed back
/// on the next access, so the type is `Clone` and keeps io errors as kind+message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {message}")]
    Spawn {
        command: String,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("handle has already been run")]
    AlreadyStarted,
    #[error("handle has not been run yet")]
    NotStarted,
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("broken pipe: {0}")]
    BrokenPipe(String),
    #[error("IO error: {message}")]
    Io { kind: io::ErrorKind, message: String },
    #[error("execution context panicked: {0}")]
    ContextPanicked(String),
}

impl ExecError {
    pub fn spawn(command: &str, e: &io::Error) -> Self {
        ExecError::Spawn {
            command: command.to_string(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    /// Non-fatal conditions are collected as notices instead of failing the handle.
    pub fn is_notice(&self) -> bool {
        matches!(self, ExecError::BrokenPipe(_))
    }
}

impl From<io::Error> for ExecError {
    fn from(e: io::Error) -> Self {
        ExecError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<nix::Error> for ExecError {
    fn from(e: nix::Error) -> Self {
        ExecError::from(io::Error::from(e))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: line {line}: {message}")]
    Parse { line: usize, message: String },
}
