//! The structured result of one synchronous spawn

use crate::error::Error;

/// Everything a finished invocation has to say: the reported error, the
/// child's exit status and terminating signal, and the captured output of
/// every writable pipe.
///
/// `status` and `output` are `None` when the child never started (for
/// example after a decode or spawn failure). A child terminated by a signal
/// reports the signal's name and, per OS convention, a status of 0.
#[derive(Debug)]
pub struct SpawnOutput {
    /// The reported error, if any. Initialization, timeout, and kill
    /// failures win over pipe-local I/O failures.
    pub error: Option<Error>,
    /// The child's exit status; `None` if it never started
    pub status: Option<i64>,
    /// Name of the terminating signal (e.g. `"SIGTERM"`), if any
    pub signal: Option<&'static str>,
    /// Captured bytes per stdio entry: `Some` for writable pipes (possibly
    /// empty), `None` for everything else; `None` as a whole if the child
    /// never started
    pub output: Option<Vec<Option<Vec<u8>>>>,
}

impl SpawnOutput {
    /// True when the child ran to completion with status 0, untouched by
    /// signals, and nothing went wrong along the way.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.status == Some(0) && self.signal.is_none()
    }

    /// The bytes captured from the child's stdout, when fd 1 was a writable
    /// pipe.
    pub fn stdout(&self) -> Option<&[u8]> {
        self.stream(1)
    }

    /// The bytes captured from the child's stderr, when fd 2 was a writable
    /// pipe.
    pub fn stderr(&self) -> Option<&[u8]> {
        self.stream(2)
    }

    fn stream(&self, fd: usize) -> Option<&[u8]> {
        self.output.as_ref()?.get(fd)?.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_a_clean_zero_exit() {
        let output = SpawnOutput {
            error: None,
            status: Some(0),
            signal: None,
            output: Some(vec![None, Some(b"hi".to_vec()), None]),
        };
        assert!(output.success());
        assert_eq!(output.stdout(), Some(&b"hi"[..]));
        assert_eq!(output.stderr(), None);
    }

    #[test]
    fn a_signaled_exit_is_not_a_success() {
        let output = SpawnOutput {
            error: None,
            status: Some(0),
            signal: Some("SIGTERM"),
            output: Some(vec![]),
        };
        assert!(!output.success());
    }

    #[test]
    fn accessors_are_none_when_the_child_never_started() {
        let output = SpawnOutput {
            error: None,
            status: None,
            signal: None,
            output: None,
        };
        assert_eq!(output.stdout(), None);
        assert_eq!(output.stderr(), None);
        assert!(!output.success());
    }
}
