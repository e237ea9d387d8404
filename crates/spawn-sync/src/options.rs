//! Spawn options and their validated, owned form
//!
//! [`SpawnOptions`] is the record a caller fills in, either directly or via
//! the builder-style methods. Before anything touches the OS the runner
//! decodes it into a [`SpawnDescriptor`]: every string is deep-copied into an
//! owned null-terminated buffer, the kill signal is resolved, and the stdio
//! plan is checked. The descriptor retains no references into caller storage.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};

/// How one of the child's file descriptors is wired.
#[derive(Debug, Clone)]
pub enum StdioDisposition {
    /// The fd is not connected to anything. Fds 0-2 are attached to
    /// `/dev/null`; higher fds are simply left closed in the child.
    Ignore,
    /// A fresh pipe between the caller and the child. Directions are from
    /// the child's perspective: `readable` carries bytes to the child,
    /// `writable` carries the child's output back for capture.
    Pipe {
        /// The child can read from this fd
        readable: bool,
        /// The child can write to this fd (output is captured)
        writable: bool,
        /// Bytes written to the child before the write side is half-closed.
        /// Only meaningful when `readable`.
        input: Option<Vec<u8>>,
    },
    /// The child's fd is a duplicate of an existing caller fd.
    Inherit {
        /// The caller-side fd to duplicate
        fd: RawFd,
    },
}

impl StdioDisposition {
    /// A pipe that feeds `input` to the child and then half-closes, so the
    /// child sees the bytes followed by EOF.
    pub fn feed(input: impl Into<Vec<u8>>) -> Self {
        Self::Pipe {
            readable: true,
            writable: false,
            input: Some(input.into()),
        }
    }

    /// A pipe that captures everything the child writes to this fd.
    pub fn capture() -> Self {
        Self::Pipe {
            readable: false,
            writable: true,
            input: None,
        }
    }
}

/// Options for one synchronous spawn.
///
/// `args` is the full argv, including `argv[0]`; [`SpawnOptions::new`] seeds
/// it with the program name. `env_pairs` replaces the child's environment
/// with the given `KEY=VALUE` strings when present, and inherits the
/// caller's environment when absent.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Path or name of the executable
    pub file: String,
    /// Full argv for the child, `argv[0]` included
    pub args: Vec<String>,
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` environment entries; `None` inherits the caller's
    pub env_pairs: Option<Vec<String>>,
    /// Run the child under this user id
    pub uid: Option<u32>,
    /// Run the child under this group id
    pub gid: Option<u32>,
    /// Detach the child into its own session
    pub detached: bool,
    /// Pass arguments verbatim on Windows; no effect on Unix
    pub windows_verbatim_arguments: bool,
    /// Kill the child if it outlives this; `None` or zero disables the timer
    pub timeout: Option<Duration>,
    /// Kill the child once total captured output exceeds this many bytes;
    /// `None` or zero means unbounded
    pub max_buffer: Option<u32>,
    /// Signal used by the timeout and max-buffer kills; default SIGTERM
    pub kill_signal: Option<i32>,
    /// One disposition per child fd, starting at fd 0
    pub stdio: Vec<StdioDisposition>,
}

impl SpawnOptions {
    /// Create options for running `file` with no arguments and no stdio.
    pub fn new(file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            args: vec![file.clone()],
            file,
            cwd: None,
            env_pairs: None,
            uid: None,
            gid: None,
            detached: false,
            windows_verbatim_arguments: false,
            timeout: None,
            max_buffer: None,
            kill_signal: None,
            stdio: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Replace the child's environment with the given `KEY=VALUE` pairs.
    pub fn env_pairs<I, S>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_pairs = Some(pairs.into_iter().map(Into::into).collect());
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the captured-output cap.
    pub fn max_buffer(mut self, max_buffer: u32) -> Self {
        self.max_buffer = Some(max_buffer);
        self
    }

    /// Set the kill signal.
    pub fn kill_signal(mut self, signal: i32) -> Self {
        self.kill_signal = Some(signal);
        self
    }

    /// Set the stdio plan.
    pub fn stdio<I>(mut self, dispositions: I) -> Self
    where
        I: IntoIterator<Item = StdioDisposition>,
    {
        self.stdio = dispositions.into_iter().collect();
        self
    }
}

/// The validated, owned form of [`SpawnOptions`]: everything the child needs,
/// deep-copied so nothing points back into caller storage.
#[derive(Debug)]
pub(crate) struct SpawnDescriptor {
    pub(crate) file: CString,
    pub(crate) argv: Vec<CString>,
    pub(crate) envp: Option<Vec<CString>>,
    pub(crate) cwd: Option<CString>,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) detached: bool,
    pub(crate) windows_verbatim_arguments: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_buffer: u64,
    pub(crate) kill_signal: Signal,
    pub(crate) stdio: Vec<StdioDisposition>,
}

impl SpawnDescriptor {
    /// Validate `options` and materialize owned copies of every field.
    pub(crate) fn decode(options: &SpawnOptions) -> Result<Self> {
        if options.file.is_empty() {
            return Err(Error::invalid_option("file", "must not be empty"));
        }
        let file = copy_string("file", &options.file)?;

        let argv = options
            .args
            .iter()
            .map(|arg| copy_string("args", arg))
            .collect::<Result<Vec<_>>>()?;

        let cwd = options
            .cwd
            .as_ref()
            .map(|dir| copy_bytes("cwd", dir.as_os_str().as_bytes()))
            .transpose()?;

        let envp = options
            .env_pairs
            .as_ref()
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|pair| {
                        match pair.find('=') {
                            // An entry the child could never look up by name
                            // is a caller mistake, not an environment.
                            None | Some(0) => Err(Error::invalid_option(
                                "envPairs",
                                format!("entry {pair:?} is not of the form KEY=VALUE"),
                            )),
                            Some(_) => copy_string("envPairs", pair),
                        }
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        // A timeout of zero means "no timer", like an absent one.
        let timeout = options.timeout.filter(|t| !t.is_zero());

        let max_buffer = u64::from(options.max_buffer.unwrap_or(0));

        let kill_signal = match options.kill_signal {
            None => Signal::SIGTERM,
            Some(0) => return Err(Error::invalid_option("killSignal", "must be nonzero")),
            Some(n) => Signal::try_from(n).map_err(|_| {
                Error::invalid_option("killSignal", format!("{n} is not a valid signal"))
            })?,
        };

        for (fd, disposition) in options.stdio.iter().enumerate() {
            match disposition {
                StdioDisposition::Ignore => {}
                StdioDisposition::Pipe {
                    readable,
                    writable,
                    input,
                } => {
                    if !readable && !writable {
                        return Err(Error::invalid_option(
                            "stdio",
                            format!("pipe for fd {fd} must be readable, writable, or both"),
                        ));
                    }
                    if input.is_some() && !readable {
                        return Err(Error::invalid_option(
                            "stdio",
                            format!("input for fd {fd} requires a readable pipe"),
                        ));
                    }
                }
                StdioDisposition::Inherit { fd: inherit_fd } => {
                    if *inherit_fd < 0 {
                        return Err(Error::invalid_option(
                            "stdio",
                            format!("fd {fd} cannot inherit negative fd {inherit_fd}"),
                        ));
                    }
                }
            }
        }

        Ok(Self {
            file,
            argv,
            envp,
            cwd,
            uid: options.uid,
            gid: options.gid,
            detached: options.detached,
            windows_verbatim_arguments: options.windows_verbatim_arguments,
            timeout,
            max_buffer,
            kill_signal,
            stdio: options.stdio.clone(),
        })
    }
}

fn copy_string(field: &'static str, value: &str) -> Result<CString> {
    copy_bytes(field, value.as_bytes())
}

fn copy_bytes(field: &'static str, value: &[u8]) -> Result<CString> {
    CString::new(value)
        .map_err(|_| Error::invalid_option(field, "contains an interior NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SpawnOptions {
        SpawnOptions::new("/bin/true")
    }

    #[test]
    fn builder_seeds_argv0_with_the_program() {
        let options = SpawnOptions::new("echo").arg("hi").arg("there");
        assert_eq!(options.args, vec!["echo", "hi", "there"]);
    }

    #[test]
    fn decode_copies_every_string() {
        let options = minimal()
            .args(["-x"])
            .current_dir("/tmp")
            .env_pairs(["HOME=/nowhere", "LANG=C"]);
        let descriptor = SpawnDescriptor::decode(&options).unwrap();
        assert_eq!(descriptor.file.to_bytes(), b"/bin/true");
        assert_eq!(descriptor.argv.len(), 2);
        assert_eq!(descriptor.cwd.as_ref().unwrap().to_bytes(), b"/tmp");
        assert_eq!(descriptor.envp.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = SpawnDescriptor::decode(&SpawnOptions::new("")).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "file", .. }));
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = SpawnDescriptor::decode(&minimal().arg("a\0b")).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "args", .. }));
    }

    #[test]
    fn zero_kill_signal_is_rejected() {
        let err = SpawnDescriptor::decode(&minimal().kill_signal(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "killSignal", .. }));
    }

    #[test]
    fn unknown_kill_signal_is_rejected() {
        let err = SpawnDescriptor::decode(&minimal().kill_signal(12345)).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "killSignal", .. }));
    }

    #[test]
    fn kill_signal_defaults_to_sigterm() {
        let descriptor = SpawnDescriptor::decode(&minimal()).unwrap();
        assert_eq!(descriptor.kill_signal, Signal::SIGTERM);
    }

    #[test]
    fn zero_timeout_disables_the_timer() {
        let descriptor =
            SpawnDescriptor::decode(&minimal().timeout(Duration::ZERO)).unwrap();
        assert!(descriptor.timeout.is_none());
    }

    #[test]
    fn directionless_pipe_is_rejected() {
        let options = minimal().stdio([StdioDisposition::Pipe {
            readable: false,
            writable: false,
            input: None,
        }]);
        let err = SpawnDescriptor::decode(&options).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "stdio", .. }));
    }

    #[test]
    fn input_on_a_non_readable_pipe_is_rejected() {
        let options = minimal().stdio([StdioDisposition::Pipe {
            readable: false,
            writable: true,
            input: Some(b"abc".to_vec()),
        }]);
        let err = SpawnDescriptor::decode(&options).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "stdio", .. }));
    }

    #[test]
    fn env_pair_without_separator_is_rejected() {
        let err =
            SpawnDescriptor::decode(&minimal().env_pairs(["NOT_A_PAIR"])).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { field: "envPairs", .. }));
    }
}
