//! Orchestration of one synchronous spawn
//!
//! The runner decodes the options, wires up the stdio pipes, spawns the
//! child, and then blocks on a single drain: the join of the child's exit
//! (raced against the kill timer when a timeout is set) and every pipe pump.
//! Teardown runs on every path, including decode and spawn failures, and the
//! result is assembled from whatever state the run reached.
//!
//! Errors live in two write-once slots. Decode, spawn, wait, timeout, and
//! kill failures take the primary slot; pipe-local I/O failures take the
//! secondary slot and only surface when the primary is empty.

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::rc::Rc;

use futures::future::join_all;
use futures_lite::future;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::{SpawnDescriptor, SpawnOptions, StdioDisposition};
use crate::output::SpawnOutput;
use crate::pipe::{dup_fd, StdioPipe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    HandlesClosed,
}

/// State shared between the runner and its pipe pumps during the drain.
///
/// Everything here is single-threaded; the cells exist because the pumps,
/// the timer, and the exit future all hold references concurrently within
/// one `block_on`.
pub(crate) struct RunnerShared {
    max_buffer: Cell<u64>,
    kill_signal: Cell<Signal>,
    child_pid: Cell<Option<i32>>,
    killed: Cell<bool>,
    buffered_output_size: Cell<u64>,
    exit_status: Cell<i64>,
    term_signal: Cell<i32>,
    error: RefCell<Option<Error>>,
    pipe_error: RefCell<Option<Error>>,
}

impl RunnerShared {
    pub(crate) fn new() -> Self {
        Self {
            max_buffer: Cell::new(0),
            kill_signal: Cell::new(Signal::SIGTERM),
            child_pid: Cell::new(None),
            killed: Cell::new(false),
            buffered_output_size: Cell::new(0),
            exit_status: Cell::new(-1),
            term_signal: Cell::new(-1),
            error: RefCell::new(None),
            pipe_error: RefCell::new(None),
        }
    }

    /// Record a primary error. First write wins.
    fn set_error(&self, error: Error) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Record a pipe-local error. First write wins.
    pub(crate) fn set_pipe_error(&self, error: Error) {
        let mut slot = self.pipe_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// The error to report: the primary if set, else the secondary.
    pub(crate) fn take_reported_error(&self) -> Option<Error> {
        self.error
            .borrow_mut()
            .take()
            .or_else(|| self.pipe_error.borrow_mut().take())
    }

    /// Account `n` freshly captured bytes and kill the child once the total
    /// exceeds the cap. The overflow itself is not an error; the caller sees
    /// the kill through the exit signal and the truncated capture.
    pub(crate) fn increment_buffered(&self, n: usize) {
        let total = self.buffered_output_size.get() + n as u64;
        self.buffered_output_size.set(total);
        let cap = self.max_buffer.get();
        if cap > 0 && total > cap {
            debug!(total, cap, "captured output exceeded the cap");
            self.kill();
        }
    }

    /// Deliver the kill signal to the child. Latches: only the first call
    /// does anything. ESRCH means the child already exited and is ignored;
    /// any other delivery failure is recorded and followed by SIGKILL so the
    /// child cannot outlive the call.
    fn kill(&self) {
        if self.killed.replace(true) {
            return;
        }
        let Some(pid) = self.child_pid.get() else {
            return;
        };
        let pid = Pid::from_raw(pid);
        let kill_signal = self.kill_signal.get();
        debug!(%pid, ?kill_signal, "killing child");
        match signal::kill(pid, kill_signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                self.set_error(Error::KillFailed {
                    signal: kill_signal as i32,
                    source: errno,
                });
                if let Err(errno) = signal::kill(pid, Signal::SIGKILL) {
                    if errno != Errno::ESRCH {
                        warn!(%pid, %errno, "SIGKILL fallback failed");
                    }
                }
            }
        }
    }

    /// The kill timer fired. A kill that was already issued counts as a
    /// stopped timer, so nothing is recorded then.
    fn on_timer(&self) {
        if self.killed.get() {
            return;
        }
        debug!("kill timer expired");
        self.set_error(Error::TimedOut);
        self.kill();
    }

    /// The child exited, or waiting for it failed.
    fn on_exit(&self, status: io::Result<std::process::ExitStatus>) {
        match status {
            Err(source) => self.set_error(Error::Wait { source }),
            Ok(status) => {
                let term_signal = status.signal().unwrap_or(0);
                // A signaled exit reports status 0, per OS convention.
                let exit_status = i64::from(status.code().unwrap_or(0));
                debug!(exit_status, term_signal, "child exited");
                self.exit_status.set(exit_status);
                self.term_signal.set(term_signal);
            }
        }
    }
}

/// One synchronous spawn. A runner is used for exactly one invocation.
pub(crate) struct Runner {
    shared: Rc<RunnerShared>,
    pipes: Vec<Option<StdioPipe>>,
    lifecycle: Lifecycle,
}

impl Runner {
    /// Run `options` to completion and assemble the result. Never panics
    /// for runtime conditions; every failure is reported in the output.
    pub(crate) fn run(options: &SpawnOptions) -> SpawnOutput {
        let mut runner = Self {
            shared: Rc::new(RunnerShared::new()),
            pipes: Vec::new(),
            lifecycle: Lifecycle::Uninitialized,
        };
        future::block_on(runner.try_initialize_and_drain(options));
        runner.close_handles();
        runner.build_result()
    }

    /// The transactional half of the run: any failure records a primary
    /// error and falls through to teardown. There is no recovery from a
    /// partial initialization.
    async fn try_initialize_and_drain(&mut self, options: &SpawnOptions) {
        assert_eq!(self.lifecycle, Lifecycle::Uninitialized, "runner reused");
        self.lifecycle = Lifecycle::Initialized;

        let descriptor = match SpawnDescriptor::decode(options) {
            Ok(descriptor) => descriptor,
            Err(err) => return self.shared.set_error(err),
        };
        self.shared.max_buffer.set(descriptor.max_buffer);
        self.shared.kill_signal.set(descriptor.kill_signal);

        for disposition in &descriptor.stdio {
            match disposition {
                StdioDisposition::Pipe {
                    readable,
                    writable,
                    input,
                } => {
                    let mut pipe =
                        StdioPipe::new(*readable, *writable, input.clone().unwrap_or_default());
                    if let Err(err) = pipe.initialize() {
                        return self.shared.set_error(err);
                    }
                    self.pipes.push(Some(pipe));
                }
                StdioDisposition::Ignore | StdioDisposition::Inherit { .. } => {
                    self.pipes.push(None);
                }
            }
        }

        let mut command = match self.build_command(&descriptor) {
            Ok(command) => command,
            Err(err) => return self.shared.set_error(err),
        };
        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => return self.shared.set_error(Error::Spawn { source }),
        };
        self.shared.child_pid.set(Some(child.id() as i32));
        debug!(pid = child.id(), file = ?descriptor.file, "spawned child");

        // The drain: child exit (raced against the kill timer) joined with
        // every pipe pump. Returning from here is the guarantee that no
        // I/O, timer, or exit event is still outstanding.
        let timeout = descriptor.timeout;
        let exit_shared = Rc::clone(&self.shared);
        let exit = async move {
            let mut child = child;
            let status = match timeout {
                Some(delay) => {
                    let timer = async {
                        smol::Timer::after(delay).await;
                        exit_shared.on_timer();
                        future::pending::<io::Result<std::process::ExitStatus>>().await
                    };
                    future::or(child.status(), timer).await
                }
                None => child.status().await,
            };
            exit_shared.on_exit(status);
        };

        let pump_shared = Rc::clone(&self.shared);
        let shared_ref: &RunnerShared = &pump_shared;
        let pumps = join_all(
            self.pipes
                .iter_mut()
                .flatten()
                .map(|pipe| pipe.run(shared_ref)),
        );

        future::zip(exit, pumps).await;

        debug_assert!(
            self.shared.exit_status.get() >= 0 || self.shared.error.borrow().is_some(),
            "drain finished without an exit status or an error"
        );
    }

    /// Build the spawnable command from the decoded descriptor: argv, env,
    /// cwd, credentials, session flags, and the stdio wiring.
    fn build_command(&mut self, descriptor: &SpawnDescriptor) -> Result<async_process::Command> {
        let mut command = std::process::Command::new(OsStr::from_bytes(descriptor.file.to_bytes()));

        if let Some(arg0) = descriptor.argv.first() {
            command.arg0(OsStr::from_bytes(arg0.to_bytes()));
        }
        for arg in descriptor.argv.iter().skip(1) {
            command.arg(OsStr::from_bytes(arg.to_bytes()));
        }

        if let Some(envp) = &descriptor.envp {
            command.env_clear();
            for pair in envp {
                let bytes = pair.to_bytes();
                // Decode validated that every pair has a separator.
                let split = bytes
                    .iter()
                    .position(|&b| b == b'=')
                    .expect("env pair has a separator");
                command.env(
                    OsStr::from_bytes(&bytes[..split]),
                    OsStr::from_bytes(&bytes[split + 1..]),
                );
            }
        }

        if let Some(cwd) = &descriptor.cwd {
            command.current_dir(OsStr::from_bytes(cwd.to_bytes()));
        }
        if let Some(uid) = descriptor.uid {
            command.uid(uid);
        }
        if let Some(gid) = descriptor.gid {
            command.gid(gid);
        }
        if descriptor.detached {
            // A detached child gets its own session.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
                });
            }
        }
        if descriptor.windows_verbatim_arguments {
            debug!("windowsVerbatimArguments has no effect on this platform");
        }

        // Fds the child should not end up with are attached to /dev/null;
        // the stdio plan overrides per entry. Entries past fd 2 go through
        // a dup2 plan that runs between fork and exec.
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());

        let mut high_fds: Vec<(RawFd, OwnedFd)> = Vec::new();
        for (fd, disposition) in descriptor.stdio.iter().enumerate() {
            let child_end = match disposition {
                StdioDisposition::Ignore => continue,
                StdioDisposition::Pipe { .. } => self.pipes[fd]
                    .as_mut()
                    .expect("pipe disposition has a pipe")
                    .take_child_end(),
                StdioDisposition::Inherit { fd: inherit_fd } => dup_fd(*inherit_fd)
                    .map_err(|source| Error::Spawn { source })?,
            };
            match fd {
                0 => {
                    command.stdin(Stdio::from(child_end));
                }
                1 => {
                    command.stdout(Stdio::from(child_end));
                }
                2 => {
                    command.stderr(Stdio::from(child_end));
                }
                _ => high_fds.push((fd as RawFd, child_end)),
            }
        }

        if !high_fds.is_empty() {
            let floor = high_fds
                .iter()
                .map(|(target, _)| *target)
                .max()
                .expect("high_fds is non-empty")
                + 1;
            // Precomputed so the post-fork closure does not allocate.
            let mut sources: Vec<RawFd> =
                high_fds.iter().map(|(_, end)| end.as_raw_fd()).collect();
            let targets: Vec<RawFd> = high_fds.iter().map(|(target, _)| *target).collect();
            let ends: Vec<OwnedFd> = high_fds.into_iter().map(|(_, end)| end).collect();
            unsafe {
                command.pre_exec(move || {
                    // Keep the ends alive in the child until exec.
                    let _ = &ends;
                    // First move every source clear of the target range so
                    // one dup2 cannot clobber another entry's source.
                    for source in sources.iter_mut() {
                        if *source < floor {
                            *source = fcntl(*source, FcntlArg::F_DUPFD_CLOEXEC(floor))
                                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
                        }
                    }
                    for (target, source) in targets.iter().zip(&sources) {
                        nix::unistd::dup2(*source, *target)
                            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
                    }
                    Ok(())
                });
            }
        }

        Ok(async_process::Command::from(command))
    }

    /// Teardown: release every pipe. Runs on every path, including decode
    /// and spawn failures.
    fn close_handles(&mut self) {
        assert_eq!(self.lifecycle, Lifecycle::Initialized, "teardown out of order");
        self.lifecycle = Lifecycle::HandlesClosed;
        for pipe in self.pipes.iter_mut().flatten() {
            pipe.close();
        }
    }

    /// Assemble the result from whatever state the run reached.
    fn build_result(&self) -> SpawnOutput {
        debug_assert_eq!(self.lifecycle, Lifecycle::HandlesClosed);

        let error = self.shared.take_reported_error();
        let exit_status = self.shared.exit_status.get();
        let started = exit_status >= 0;
        let term_signal = self.shared.term_signal.get();

        let signal = if term_signal > 0 {
            Signal::try_from(term_signal).ok().map(Signal::as_str)
        } else {
            None
        };

        let output = started.then(|| {
            self.pipes
                .iter()
                .map(|pipe| match pipe {
                    Some(pipe) if pipe.writable() => Some(pipe.output_bytes()),
                    _ => None,
                })
                .collect()
        });

        SpawnOutput {
            error,
            status: started.then_some(exit_status),
            signal,
            output,
        }
    }
}
