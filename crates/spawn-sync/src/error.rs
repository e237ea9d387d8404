//! Error types for synchronous process execution

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Unified error type for a synchronous spawn.
///
/// Errors never abort an invocation; they are collected by the runner and
/// reported through [`SpawnOutput::error`](crate::SpawnOutput). Pipe-local
/// I/O failures are kept in a separate low-priority slot and only surface
/// when no more serious error occurred.
#[derive(Debug, Error)]
pub enum Error {
    /// An option failed validation.
    #[error("invalid `{field}` option: {reason}")]
    InvalidOption {
        /// The option field that failed validation
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Creating or registering an OS resource failed before the child ran.
    #[error("failed to initialize {what}: {source}")]
    ResourceInit {
        /// The resource being set up when the failure occurred
        what: &'static str,
        /// The underlying OS error
        source: io::Error,
    },

    /// Spawning the child process failed.
    #[error("failed to spawn process: {source}")]
    Spawn {
        /// The underlying OS error
        source: io::Error,
    },

    /// Waiting for the child's exit status failed.
    #[error("failed to wait for process: {source}")]
    Wait {
        /// The underlying OS error
        source: io::Error,
    },

    /// The kill timer fired before the child exited.
    #[error("process timed out")]
    TimedOut,

    /// Delivering the kill signal failed for a reason other than the child
    /// having already exited.
    #[error("failed to deliver signal {signal}: {source}")]
    KillFailed {
        /// The signal that could not be delivered
        signal: i32,
        /// The errno reported for the delivery attempt
        source: Errno,
    },

    /// A read, write, or shutdown on one of the stdio pipes failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Create an invalid-option error for `field`.
    pub(crate) fn invalid_option(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            field,
            reason: reason.into(),
        }
    }

    /// The errno-style integer code behind this error, when one exists.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::InvalidOption { .. } => Some(Errno::EINVAL as i32),
            Self::ResourceInit { source, .. } => source.raw_os_error(),
            Self::Spawn { source } => source.raw_os_error(),
            Self::Wait { source } => source.raw_os_error(),
            Self::TimedOut => Some(Errno::ETIMEDOUT as i32),
            Self::KillFailed { source, .. } => Some(*source as i32),
            Self::Io(source) => source.raw_os_error(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
