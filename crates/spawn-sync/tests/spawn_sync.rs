//! End-to-end tests for the synchronous runner

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use spawn_sync::{spawn_sync, Error, SpawnOptions, StdioDisposition};

const SIGKILL: i32 = 9;

fn standard_streams() -> [StdioDisposition; 3] {
    [
        StdioDisposition::Ignore,
        StdioDisposition::capture(),
        StdioDisposition::Ignore,
    ]
}

fn ignored_streams() -> [StdioDisposition; 3] {
    [
        StdioDisposition::Ignore,
        StdioDisposition::Ignore,
        StdioDisposition::Ignore,
    ]
}

#[test]
fn echo_captures_stdout() {
    let options = SpawnOptions::new("echo").arg("hi").stdio(standard_streams());
    let result = spawn_sync(&options);

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.status, Some(0));
    assert_eq!(result.signal, None);

    let output = result.output.as_ref().unwrap();
    assert_eq!(output.len(), 3);
    assert_eq!(output[0], None);
    assert_eq!(output[1].as_deref(), Some(&b"hi\n"[..]));
    assert_eq!(output[2], None);
    assert!(result.success());
}

#[test]
fn cat_roundtrips_stdin() {
    let options = SpawnOptions::new("cat").stdio([
        StdioDisposition::feed(&b"abc"[..]),
        StdioDisposition::capture(),
        StdioDisposition::Ignore,
    ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    assert_eq!(result.stdout(), Some(&b"abc"[..]));
}

#[test]
fn empty_input_still_reaches_eof() {
    // cat must terminate even though nothing is written: the write side is
    // half-closed regardless of input size.
    let options = SpawnOptions::new("cat").stdio([
        StdioDisposition::Pipe {
            readable: true,
            writable: false,
            input: None,
        },
        StdioDisposition::capture(),
        StdioDisposition::Ignore,
    ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    assert_eq!(result.stdout(), Some(&b""[..]));
}

#[test]
fn exit_code_is_propagated() {
    let options = SpawnOptions::new("sh")
        .args(["-c", "exit 42"])
        .stdio(ignored_streams());
    let result = spawn_sync(&options);

    assert!(result.error.is_none());
    assert_eq!(result.status, Some(42));
    assert_eq!(result.signal, None);
}

#[test]
fn stdout_and_stderr_are_captured_separately() {
    let options = SpawnOptions::new("sh")
        .args(["-c", "echo out; echo err >&2"])
        .stdio([
            StdioDisposition::Ignore,
            StdioDisposition::capture(),
            StdioDisposition::capture(),
        ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    assert_eq!(result.stdout(), Some(&b"out\n"[..]));
    assert_eq!(result.stderr(), Some(&b"err\n"[..]));
}

#[test]
fn large_output_is_captured_intact() {
    // Spans several 64 KiB capture chunks.
    let options = SpawnOptions::new("sh")
        .args(["-c", "head -c 200000 /dev/zero"])
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    let stdout = result.stdout().unwrap();
    assert_eq!(stdout.len(), 200_000);
    assert!(stdout.iter().all(|&b| b == 0));
}

#[test]
fn duplex_pipe_flows_both_ways() {
    // The child reads its input from fd 0 and writes it back to the same
    // fd; one disposition carries both directions.
    let options = SpawnOptions::new("sh").args(["-c", "cat >&0"]).stdio([
        StdioDisposition::Pipe {
            readable: true,
            writable: true,
            input: Some(b"ping".to_vec()),
        },
        StdioDisposition::Ignore,
        StdioDisposition::Ignore,
    ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    let output = result.output.as_ref().unwrap();
    assert_eq!(output[0].as_deref(), Some(&b"ping"[..]));
}

#[test]
fn pipes_beyond_stderr_are_wired_up() {
    let options = SpawnOptions::new("sh")
        .args(["-c", "echo extra >&3"])
        .stdio([
            StdioDisposition::Ignore,
            StdioDisposition::Ignore,
            StdioDisposition::Ignore,
            StdioDisposition::capture(),
        ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    let output = result.output.as_ref().unwrap();
    assert_eq!(output.len(), 4);
    assert_eq!(output[3].as_deref(), Some(&b"extra\n"[..]));
}

#[test]
fn environment_is_replaced_by_env_pairs() {
    let options = SpawnOptions::new("/bin/sh")
        .args(["-c", "echo $TEST_VAR"])
        .env_pairs(["TEST_VAR=test_value"])
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    assert_eq!(result.stdout(), Some(&b"test_value\n"[..]));
}

#[test]
fn working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let canonical = dir.path().canonicalize().unwrap();

    let options = SpawnOptions::new("pwd")
        .current_dir(&canonical)
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    let mut expected = canonical.display().to_string().into_bytes();
    expected.push(b'\n');
    assert_eq!(result.stdout(), Some(&expected[..]));
}

#[test]
fn inherited_fd_receives_the_child_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("captured");
    let file = std::fs::File::create(&path).unwrap();

    let options = SpawnOptions::new("echo").arg("via fd").stdio([
        StdioDisposition::Ignore,
        StdioDisposition::Inherit {
            fd: file.as_raw_fd(),
        },
        StdioDisposition::Ignore,
    ]);
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    // Inherited fds are never captured.
    assert_eq!(result.output.as_ref().unwrap()[1], None);

    let mut contents = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "via fd\n");
}

#[test]
fn spawn_failure_reports_the_os_error() {
    let options = SpawnOptions::new("/no/such/executable-12345")
        .stdio(ignored_streams());
    let result = spawn_sync(&options);

    match &result.error {
        Some(Error::Spawn { source }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
        }
        other => panic!("expected a spawn error, got {other:?}"),
    }
    assert_eq!(result.status, None);
    assert_eq!(result.signal, None);
    assert!(result.output.is_none());
}

#[test]
fn zero_kill_signal_is_rejected_before_spawning() {
    let options = SpawnOptions::new("echo")
        .kill_signal(0)
        .stdio(ignored_streams());
    let result = spawn_sync(&options);

    assert!(matches!(
        result.error,
        Some(Error::InvalidOption {
            field: "killSignal",
            ..
        })
    ));
    assert_eq!(result.status, None);
    assert!(result.output.is_none());
}

#[test]
fn timeout_kills_a_lingering_child() {
    let options = SpawnOptions::new("sleep")
        .arg("10")
        .timeout(Duration::from_millis(50))
        .stdio(ignored_streams());
    let start = std::time::Instant::now();
    let result = spawn_sync(&options);

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(matches!(result.error, Some(Error::TimedOut)));
    assert_eq!(result.signal, Some("SIGTERM"));
    // Signaled exits report status 0.
    assert_eq!(result.status, Some(0));
}

#[test]
fn timeout_uses_the_configured_kill_signal() {
    let options = SpawnOptions::new("sleep")
        .arg("10")
        .timeout(Duration::from_millis(50))
        .kill_signal(SIGKILL)
        .stdio(ignored_streams());
    let result = spawn_sync(&options);

    assert!(matches!(result.error, Some(Error::TimedOut)));
    assert_eq!(result.signal, Some("SIGKILL"));
}

#[test]
fn zero_timeout_means_no_timer() {
    let options = SpawnOptions::new("echo")
        .arg("quick")
        .timeout(Duration::ZERO)
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert!(result.error.is_none());
    assert_eq!(result.status, Some(0));
}

#[test]
fn exceeding_max_buffer_kills_the_child() {
    let options = SpawnOptions::new("yes")
        .max_buffer(1024)
        .kill_signal(SIGKILL)
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert_eq!(result.signal, Some("SIGKILL"));
    // The read that tipped over the cap is still captured.
    let stdout = result.stdout().unwrap();
    assert!(stdout.len() > 1024, "captured only {} bytes", stdout.len());
}

#[test]
fn max_buffer_zero_is_unbounded() {
    let options = SpawnOptions::new("sh")
        .args(["-c", "head -c 200000 /dev/zero"])
        .max_buffer(0)
        .stdio(standard_streams());
    let result = spawn_sync(&options);

    assert_eq!(result.status, Some(0));
    assert_eq!(result.signal, None);
    assert_eq!(result.stdout().unwrap().len(), 200_000);
}

#[test]
fn empty_stdio_plan_still_runs() {
    let options = SpawnOptions::new("echo").arg("nowhere");
    let result = spawn_sync(&options);

    assert!(result.error.is_none());
    assert_eq!(result.status, Some(0));
    assert_eq!(result.output.as_ref().unwrap().len(), 0);
}
