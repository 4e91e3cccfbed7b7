/// Process Supervisor - lifecycle of one child process
///
/// **Core Responsibility:**
/// Spawn an invocation, feed stdin, drain stdout/stderr, and stop the child on
/// timeout, output overflow or cancellation.
///
/// **Safety Guarantees:**
/// - stdout and stderr are drained on their own tasks from spawn onwards, so a
///   full pipe can never stall the child
/// - Combined output is capped; overflowing kills the child and is reported
///   as an output-limit result, not a truncated success
/// - Stopping is SIGTERM to the process group, a bounded grace period, then
///   SIGKILL
/// - However the run ends, the whole process group is killed before `run`
///   returns, so nothing the program forked outlives it
/// - One invocation in flight per supervisor; a second `run` is rejected
use crate::error::ExecutionError;
use runlab_common::types::ExecutionResult;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Upper bound on draining pipes once the child is gone. Grandchildren that
/// inherited the pipes could otherwise keep them open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Concrete program, arguments and working directory to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Combined stdout + stderr bytes
    pub output_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Output forwarded live while the child runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    OutputLimit,
    TimedOut,
}

pub struct ProcessSupervisor {
    grace_period: Duration,
    active: Mutex<Option<CancellationToken>>,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            active: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.active).is_some()
    }

    /// Ask the in-flight invocation to stop. No-op when nothing is running;
    /// never waits for the child.
    pub fn cancel(&self) {
        if let Some(token) = lock_unpoisoned(&self.active).as_ref() {
            info!("Cancelling running process");
            token.cancel();
        }
    }

    /// Run `invocation` to completion, timeout, overflow or cancellation.
    ///
    /// Cancelling `cancel` (or calling [`ProcessSupervisor::cancel`]) stops the
    /// child. The returned result is already classified; `Err` is reserved for
    /// failures that are not the program's own doing.
    pub async fn run(
        &self,
        invocation: &Invocation,
        input: &str,
        limits: RunLimits,
        cancel: &CancellationToken,
        sink: Option<OutputSink>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let token = self.begin(cancel)?;
        let _active = ActiveRun { slot: &self.active };

        if token.is_cancelled() {
            return Ok(ExecutionResult::cancelled());
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecutionError::Spawn {
            program: invocation.program.display().to_string(),
            source,
        })?;

        let group = ProcessGroup(child.id());
        debug!(
            program = %invocation.program.display(),
            pid = ?group.0,
            timeout_ms = limits.timeout.as_millis() as u64,
            output_limit = limits.output_limit,
            "Spawned child process"
        );

        let capture = Arc::new(Capture::new(limits.output_limit));
        let stdin_task = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(feed_stdin(stdin, input.as_bytes().to_vec())));
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(drain(stdout, OutputStream::Stdout, capture.clone(), sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain(stderr, OutputStream::Stderr, capture.clone(), sink)));

        // Explicit cancellation wins any tie
        let ending = tokio::select! {
            biased;
            _ = token.cancelled() => Ending::Cancelled,
            _ = capture.overflow.cancelled() => Ending::OutputLimit,
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(limits.timeout) => Ending::TimedOut,
        };

        let exit_status = match &ending {
            Ending::Exited(Ok(status)) => Some(*status),
            _ => self.terminate(&mut child, group).await,
        };
        // Background processes left in the group die with the run
        group.signal(&mut child, true);

        if let Some(task) = stdin_task {
            task.abort();
        }
        tokio::join!(finish_drain(stdout_task), finish_drain(stderr_task));

        let execution_time_ms = start.elapsed().as_millis() as u64;
        let (stdout, stderr, exceeded) = capture.take();
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let result = match ending {
            Ending::Exited(Err(e)) => return Err(ExecutionError::Io(e)),
            Ending::Cancelled => {
                info!(execution_ms = execution_time_ms, "Process cancelled");
                ExecutionResult::cancelled().with_captured(stdout, stderr)
            }
            Ending::TimedOut => {
                warn!(
                    execution_ms = execution_time_ms,
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Process timed out"
                );
                ExecutionResult::timeout().with_captured(stdout, stderr)
            }
            Ending::OutputLimit => {
                warn!(output_limit = limits.output_limit, "Process exceeded output limit");
                ExecutionResult::limit_exceeded().with_captured(stdout, stderr)
            }
            // Overflow noticed while draining after a natural exit
            Ending::Exited(Ok(_)) if exceeded => {
                warn!(output_limit = limits.output_limit, "Process exceeded output limit");
                ExecutionResult::limit_exceeded().with_captured(stdout, stderr)
            }
            Ending::Exited(Ok(status)) => exit_result(status, stdout, stderr),
        };

        debug!(
            exit_code = result.exit_code(),
            outcome = ?result.outcome(),
            status = ?exit_status,
            execution_ms = execution_time_ms,
            "Process finished"
        );

        Ok(result.with_elapsed(execution_time_ms))
    }

    fn begin(&self, parent: &CancellationToken) -> Result<CancellationToken, ExecutionError> {
        let mut slot = lock_unpoisoned(&self.active);
        if slot.is_some() {
            return Err(ExecutionError::Busy);
        }
        let token = parent.child_token();
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Graceful terminate, then forced kill once the grace period lapses
    async fn terminate(&self, child: &mut Child, group: ProcessGroup) -> Option<ExitStatus> {
        group.signal(child, false);

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => debug!(error = %e, "Wait failed after terminate signal"),
            Err(_) => warn!(
                grace_ms = self.grace_period.as_millis() as u64,
                "Process ignored terminate signal, killing"
            ),
        }

        group.signal(child, true);
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Forced kill failed");
        }
        child.try_wait().ok().flatten()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

/// Clears the in-flight slot however `run` exits
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *lock_unpoisoned(self.slot) = None;
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct CaptureState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    used: usize,
    exceeded: bool,
}

/// Output shared by both drain tasks, with one budget for both streams
struct Capture {
    limit: usize,
    state: Mutex<CaptureState>,
    overflow: CancellationToken,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(CaptureState::default()),
            overflow: CancellationToken::new(),
        }
    }

    /// Store what fits in the budget and return how many bytes were kept
    fn accept(&self, stream: OutputStream, chunk: &[u8]) -> usize {
        let mut state = lock_unpoisoned(&self.state);
        if state.exceeded {
            return 0;
        }

        let remaining = self.limit.saturating_sub(state.used);
        let accepted = chunk.len().min(remaining);
        state.used += accepted;
        match stream {
            OutputStream::Stdout => state.stdout.extend_from_slice(&chunk[..accepted]),
            OutputStream::Stderr => state.stderr.extend_from_slice(&chunk[..accepted]),
        }

        if chunk.len() > remaining {
            state.exceeded = true;
            self.overflow.cancel();
        }
        accepted
    }

    fn take(&self) -> (Vec<u8>, Vec<u8>, bool) {
        let mut state = lock_unpoisoned(&self.state);
        (
            std::mem::take(&mut state.stdout),
            std::mem::take(&mut state.stderr),
            state.exceeded,
        )
    }
}

async fn feed_stdin(mut stdin: ChildStdin, input: Vec<u8>) {
    if input.is_empty() {
        return;
    }
    if let Err(e) = stdin.write_all(&input).await {
        // Programs that never read their input close the pipe early
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            debug!(error = %e, "Failed to write child stdin");
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    capture: Arc<Capture>,
    sink: Option<OutputSink>,
) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    // Accepted bytes not yet forwarded, at most one split character
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let accepted = capture.accept(stream, &buf[..n]);
                if let (Some(sink), true) = (&sink, accepted > 0) {
                    pending.extend_from_slice(&buf[..accepted]);
                    let text = take_complete_utf8(&mut pending);
                    if !text.is_empty() {
                        // Receiver gone just means nobody is watching anymore
                        let _ = sink.send(OutputChunk { stream, text });
                    }
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "Stopped reading child output");
                break;
            }
        }
    }

    if let (Some(sink), false) = (&sink, pending.is_empty()) {
        let _ = sink.send(OutputChunk {
            stream,
            text: String::from_utf8_lossy(&pending).into_owned(),
        });
    }
}

/// Decode `pending` up to a multibyte character cut off by the read boundary;
/// those trailing bytes stay in `pending` for the next read.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes, not a split: decode lossily as they are
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
    pending.drain(..complete);
    text
}

async fn finish_drain(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
        debug!("Output pipe still open after exit, abandoning drain");
        task.abort();
    }
}

fn exit_result(status: ExitStatus, stdout: String, stderr: String) -> ExecutionResult {
    let result = ExecutionResult::exited(stdout, stderr, exit_code(status));
    match signal_note(status) {
        Some(note) => result.with_note(note),
        None => result,
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn signal_note(status: ExitStatus) -> Option<&'static str> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    match Signal::try_from(status.signal()?).ok()? {
        Signal::SIGKILL => Some("Killed (likely out of memory)"),
        Signal::SIGSEGV => Some("Segmentation fault"),
        Signal::SIGABRT => Some("Aborted"),
        Signal::SIGILL => Some("Illegal instruction"),
        _ => None,
    }
}

#[cfg(not(unix))]
fn signal_note(_status: ExitStatus) -> Option<&'static str> {
    None
}

/// Process group led by the child. The id is captured at spawn because
/// `Child::id` is gone once the leader has been reaped, while the rest of the
/// group may still be running.
#[derive(Debug, Clone, Copy)]
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    #[cfg(unix)]
    fn signal(self, _child: &mut Child, force: bool) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.0 else {
            return;
        };
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match killpg(Pid::from_raw(pgid as i32), signal) {
            // Group already empty
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(pgid, ?signal, error = %e, "Failed to signal process group"),
        }
    }

    #[cfg(not(unix))]
    fn signal(self, child: &mut Child, _force: bool) {
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Failed to kill child");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_shares_budget_across_streams() {
        let capture = Capture::new(10);

        assert_eq!(capture.accept(OutputStream::Stdout, b"12345"), 5);
        assert_eq!(capture.accept(OutputStream::Stderr, b"1234"), 4);
        assert!(!capture.overflow.is_cancelled());

        assert_eq!(capture.accept(OutputStream::Stdout, b"abc"), 1);
        assert!(capture.overflow.is_cancelled());
        assert_eq!(capture.accept(OutputStream::Stderr, b"more"), 0);

        let (stdout, stderr, exceeded) = capture.take();
        assert_eq!(stdout, b"12345a");
        assert_eq!(stderr, b"1234");
        assert!(exceeded);
    }

    #[test]
    fn test_split_character_waits_for_next_read() {
        // "é" is 0xC3 0xA9
        let mut pending = b"caf\xC3".to_vec();
        assert_eq!(take_complete_utf8(&mut pending), "caf");
        assert_eq!(pending, b"\xC3");

        pending.extend_from_slice(b"\xA9!");
        assert_eq!(take_complete_utf8(&mut pending), "\u{e9}!");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_invalid_bytes_are_not_held_back() {
        let mut pending = b"a\xFFb".to_vec();
        assert_eq!(take_complete_utf8(&mut pending), "a\u{FFFD}b");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_capture_exact_limit_is_not_overflow() {
        let capture = Capture::new(4);
        assert_eq!(capture.accept(OutputStream::Stdout, b"abcd"), 4);
        assert!(!capture.overflow.is_cancelled());
    }

    #[test]
    fn test_cancel_without_run_is_noop() {
        let supervisor = ProcessSupervisor::default();
        supervisor.cancel();
        supervisor.cancel();
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_second_begin_is_busy() {
        let supervisor = ProcessSupervisor::default();
        let parent = CancellationToken::new();

        let _token = supervisor.begin(&parent).unwrap();
        assert!(supervisor.is_running());
        assert!(matches!(supervisor.begin(&parent), Err(ExecutionError::Busy)));
    }
}
