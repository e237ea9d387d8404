//! Per-stream pipe state machine
//!
//! Each piped stdio entry owns one end of a Unix socket pair; the other end
//! is handed to the child. A pipe that is readable from the child's side
//! writes the caller-supplied input and then half-closes, so the child always
//! observes EOF. A pipe that is writable from the child's side pumps
//! everything the child writes into a [`ChunkChain`].
//!
//! I/O failures on a pipe are symptoms, not causes: they are demoted to the
//! runner's low-priority error slot and never interrupt the run.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, MsgFlags, Shutdown, SockFlag, SockType};
use smol::Async;

use crate::chunk::ChunkChain;
use crate::error::{Error, Result};
use crate::runner::RunnerShared;

/// Lifecycle of a pipe. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    Started,
    Closed,
}

/// One stdio pipe between the caller and the child.
pub(crate) struct StdioPipe {
    readable: bool,
    writable: bool,
    input: Vec<u8>,
    chunks: ChunkChain,
    parent_end: Option<Async<OwnedFd>>,
    child_end: Option<OwnedFd>,
    lifecycle: Lifecycle,
}

impl StdioPipe {
    /// `readable`/`writable` are from the child's perspective; `input` is
    /// written to a readable pipe before its write side is half-closed.
    pub(crate) fn new(readable: bool, writable: bool, input: Vec<u8>) -> Self {
        assert!(readable || writable, "pipe must have a direction");
        Self {
            readable,
            writable,
            input,
            chunks: ChunkChain::new(),
            parent_end: None,
            child_end: None,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable
    }

    /// Create the socket pair and register the caller's end with the
    /// reactor.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        assert_eq!(self.lifecycle, Lifecycle::Uninitialized, "pipe initialized twice");

        let (parent, child) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|errno| Error::ResourceInit {
            what: "stdio pipe",
            source: errno_to_io(errno),
        })?;

        let parent = Async::new(parent).map_err(|source| Error::ResourceInit {
            what: "stdio pipe",
            source,
        })?;

        self.parent_end = Some(parent);
        self.child_end = Some(child);
        self.lifecycle = Lifecycle::Initialized;
        Ok(())
    }

    /// The end destined for the child's fd table.
    pub(crate) fn take_child_end(&mut self) -> OwnedFd {
        assert_eq!(self.lifecycle, Lifecycle::Initialized, "child end taken out of order");
        self.child_end.take().expect("child end already taken")
    }

    /// Drive this pipe to completion: write the input and half-close, and
    /// pump child output into the capture chain until EOF. A duplex pipe
    /// runs both halves concurrently.
    pub(crate) async fn run(&mut self, runner: &RunnerShared) {
        assert_eq!(self.lifecycle, Lifecycle::Initialized, "pipe started out of order");
        self.lifecycle = Lifecycle::Started;

        let Self {
            readable,
            writable,
            input,
            chunks,
            parent_end,
            ..
        } = self;
        let io = parent_end.as_ref().expect("started pipe has a live handle");

        let write_half = async {
            if *readable {
                if !input.is_empty() {
                    if let Err(err) = write_all(io, input).await {
                        runner.set_pipe_error(err.into());
                    }
                }
                // Half-close so the child sees EOF after the input, even
                // when there is no input at all.
                if let Err(errno) = socket::shutdown(io.get_ref().as_raw_fd(), Shutdown::Write) {
                    runner.set_pipe_error(errno_to_io(errno).into());
                }
            }
        };

        let read_half = async {
            if *writable {
                loop {
                    let result = {
                        let region = chunks.alloc();
                        read_some(io, region).await
                    };
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            chunks.commit(n);
                            runner.increment_buffered(n);
                        }
                        Err(err) => {
                            runner.set_pipe_error(err.into());
                            break;
                        }
                    }
                }
            }
        };

        futures_lite::future::zip(write_half, read_half).await;
    }

    /// Release both ends of the pipe.
    pub(crate) fn close(&mut self) {
        assert!(
            matches!(self.lifecycle, Lifecycle::Initialized | Lifecycle::Started),
            "pipe closed out of order"
        );
        self.parent_end = None;
        self.child_end = None;
        self.lifecycle = Lifecycle::Closed;
    }

    /// The captured output as one contiguous buffer.
    pub(crate) fn output_bytes(&self) -> Vec<u8> {
        debug_assert!(self.writable, "output requested from a non-writable pipe");
        self.chunks.to_bytes()
    }
}

impl Drop for StdioPipe {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                matches!(self.lifecycle, Lifecycle::Uninitialized | Lifecycle::Closed),
                "pipe dropped while open"
            );
        }
    }
}

/// Duplicate an inherited caller fd so the child gets its own copy.
pub(crate) fn dup_fd(fd: std::os::unix::io::RawFd) -> io::Result<OwnedFd> {
    nix::unistd::dup(fd)
        .map_err(errno_to_io)
        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

async fn read_some(io: &Async<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    io.read_with(|fd| loop {
        match nix::unistd::read(fd.as_raw_fd(), buf) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
            Err(errno) => return Err(errno_to_io(errno)),
        }
    })
    .await
}

/// Write the whole buffer. `MSG_NOSIGNAL` turns a dead peer into EPIPE
/// instead of SIGPIPE.
async fn write_all(io: &Async<OwnedFd>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = io
            .write_with(|fd| loop {
                match socket::send(fd.as_raw_fd(), data, MsgFlags::MSG_NOSIGNAL) {
                    Ok(n) => return Ok(n),
                    Err(Errno::EINTR) => continue,
                    Err(Errno::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
                    Err(errno) => return Err(errno_to_io(errno)),
                }
            })
            .await?;
        data = &data[n..];
    }
    Ok(())
}
