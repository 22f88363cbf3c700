//! Running external checks and verify commands with timeouts and bounded output.

use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long output readers may outlive the deadline before they are abandoned.
/// A detached grandchild can hold the pipes open after the child is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

type StreamTail = Result<(Vec<u8>, usize)>;

/// Captured child process output. Only the tail of each stream is kept.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Exit 0 within the deadline.
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout and stderr joined, as used for signature extraction.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout_lossy(), self.stderr_lossy())
    }
}

/// Whether `err` came from spawning a program that does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
}

/// Build a `Command` from an argv vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is drained concurrently while the child runs; only the last
/// `output_limit_bytes` of each stream are kept. A child still running at the
/// deadline is killed together with its process group and reported with
/// `timed_out`. Readers still blocked after the deadline are abandoned, so the
/// call never waits on descendants that keep the pipes open.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let reader_deadline = (started + timeout).max(Instant::now()) + READER_GRACE;
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, reader_deadline, "stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, reader_deadline, "stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed: started.elapsed(),
    })
}

/// Kill the child's whole process group, then the child itself.
fn kill_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = i32::try_from(child.id()).context("child pid out of range")?;
        if let Err(errno) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!(%errno, "killpg failed; falling back to killing the child");
        }
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped by the group kill.
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamTail> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_stream_tail(reader, limit));
    });
    rx
}

/// Wait for a reader until `deadline`; an abandoned reader yields no output.
fn collect_output(rx: &Receiver<StreamTail>, deadline: Instant, stream: &str) -> StreamTail {
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(result) => result.with_context(|| format!("read {stream}")),
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream, "output still open after the deadline; abandoning reader");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{stream} reader thread panicked")),
    }
}

/// Drain `reader`, keeping the last `limit` bytes. Returns the dropped byte count.
fn read_stream_tail<R: Read>(mut reader: R, limit: usize) -> StreamTail {
    let mut buf = Vec::new();
    let mut total = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        total += n;
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit.saturating_mul(2).max(chunk.len()) {
            let excess = buf.len() - limit;
            buf.drain(..excess);
        }
    }

    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
    }
    let dropped = total - buf.len();
    Ok((buf, dropped))
}
