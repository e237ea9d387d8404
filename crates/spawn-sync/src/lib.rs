//! Synchronous child-process execution with full I/O capture
//!
//! This crate runs one child process to completion per call: it spawns the
//! executable described by [`SpawnOptions`], feeds input to and captures
//! output from its stdio pipes, enforces an optional timeout and an optional
//! cap on the total captured output, and returns a [`SpawnOutput`] with the
//! exit status, the terminating signal, the per-fd captures, and any error.
//!
//! The call blocks until everything is settled; internally a private drain
//! drives the pipe pumps, the kill timer, and the exit notification on the
//! calling thread. No error escapes as a panic: spawn failures, timeouts,
//! and I/O failures are all reported through the result.
//!
//! ```
//! use spawn_sync::{spawn_sync, SpawnOptions, StdioDisposition};
//!
//! let options = SpawnOptions::new("echo").arg("hello").stdio([
//!     StdioDisposition::Ignore,
//!     StdioDisposition::capture(),
//!     StdioDisposition::Ignore,
//! ]);
//! let result = spawn_sync(&options);
//! assert_eq!(result.status, Some(0));
//! assert_eq!(result.stdout(), Some(&b"hello\n"[..]));
//! ```

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("spawn-sync only supports Unix platforms");

mod chunk;
pub mod error;
pub mod options;
pub mod output;
mod pipe;
mod runner;

pub use error::{Error, Result};
pub use options::{SpawnOptions, StdioDisposition};
pub use output::SpawnOutput;

/// Spawn a child process and block until it has exited and all of its
/// captured I/O has drained.
///
/// Always returns a [`SpawnOutput`]; failures of any kind are recorded in
/// its `error` field rather than propagated.
pub fn spawn_sync(options: &SpawnOptions) -> SpawnOutput {
    runner::Runner::run(options)
}
