//! Helpers for running child processes that can be cancelled.
//!
//! Every child is spawned in its own process group. Output is read on helper
//! threads so the calling thread never blocks on a pipe: it polls a channel
//! (or `wait_timeout`) and checks the [`CancelToken`] between polls. When the
//! token fires the whole group gets SIGTERM, then SIGKILL after
//! [`TERMINATE_GRACE`], and the caller receives [`PipelineError::Cancelled`].

use std::io::{BufRead, BufReader, PipeReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::error::PipelineError;

/// How often blocked readers re-check the cancellation token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Time a terminated process group gets before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Result of draining a line-oriented stream.
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: ExitStatus,
    /// Set when reading the pipe failed part-way.
    pub read_error: Option<String>,
}

/// Fully captured child output.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Put the child in a new process group so it can be signalled as a unit.
pub fn isolate(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

/// Spawn `cmd` with stdout and stderr merged into one pipe.
pub fn spawn_merged(mut cmd: Command) -> std::io::Result<(Child, PipeReader)> {
    let (reader, writer) = std::io::pipe()?;
    cmd.stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    isolate(&mut cmd);
    let child = cmd.spawn()?;
    // `cmd` owns the parent's copies of the write end; dropping it lets the
    // reader see EOF once the child exits.
    drop(cmd);
    Ok((child, reader))
}

/// Spawn `cmd` with separate stdout and stderr pipes.
pub fn spawn_piped(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate(&mut cmd);
    cmd.spawn()
}

/// Read `reader` line by line, handing each line (with its newline) to
/// `on_line`, then wait for the child.
#[instrument(skip_all, fields(pid = child.id()))]
pub fn stream_lines<R, F>(
    child: &mut Child,
    reader: R,
    cancel: &CancelToken,
    mut on_line: F,
) -> Result<StreamOutcome>
where
    R: Read + Send + 'static,
    F: FnMut(&str),
{
    let (tx, rx) = mpsc::channel::<std::io::Result<String>>();
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if tx.send(Ok(text)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    break;
                }
            }
        }
    });

    let mut read_error = None;
    loop {
        if cancel.is_cancelled() {
            terminate_group(child)?;
            return Err(PipelineError::Cancelled.into());
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(line)) => on_line(&line),
            Ok(Err(err)) => {
                warn!(err = %err, "output read failed");
                read_error = Some(err.to_string());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = wait_cancellable(child, cancel)?;
    debug!(exit_code = ?status.code(), "stream drained");
    Ok(StreamOutcome { status, read_error })
}

/// Read everything from a pipe on a helper thread.
pub fn read_all_in_background<R>(reader: R) -> thread::JoinHandle<Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = reader;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).context("read output")?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

/// Run `cmd` to completion, capturing stdout and stderr in full.
#[instrument(skip_all)]
pub fn run_captured(cmd: Command, cancel: &CancelToken) -> Result<CapturedOutput> {
    let mut child = spawn_piped(cmd).context("spawn command")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = read_all_in_background(stdout);
    let stderr_handle = read_all_in_background(stderr);

    let status = wait_cancellable(&mut child, cancel)?;
    let stdout = join_output(join_cancellable(stdout_handle, &mut child, cancel)?)
        .context("join stdout")?;
    let stderr = join_output(join_cancellable(stderr_handle, &mut child, cancel)?)
        .context("join stderr")?;

    debug!(exit_code = ?status.code(), "command finished");
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
    })
}

/// Wait for a reader thread after its child has exited.
///
/// A background process left behind by the child can keep the pipe open long
/// after the child is gone, so the join polls the token too. On cancellation
/// whatever is left of the process group is killed and the reader is
/// abandoned. The outer error is only ever [`PipelineError::Cancelled`].
pub fn join_cancellable<T>(
    handle: thread::JoinHandle<T>,
    child: &mut Child,
    cancel: &CancelToken,
) -> Result<thread::Result<T>> {
    while !handle.is_finished() {
        if cancel.sleep(POLL_INTERVAL) {
            warn!(pid = child.id(), "cancelled while output pipe held open, killing group");
            signal_group(child, GroupSignal::Kill);
            return Err(PipelineError::Cancelled.into());
        }
    }
    Ok(handle.join())
}

pub fn join_output(joined: thread::Result<Result<String>>) -> Result<String> {
    match joined {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Wait for the child, terminating its group if cancellation is requested.
pub fn wait_cancellable(child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus> {
    loop {
        if cancel.is_cancelled() {
            terminate_group(child)?;
            return Err(PipelineError::Cancelled.into());
        }
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for child")?
        {
            return Ok(status);
        }
    }
}

/// SIGTERM the child's process group, wait up to [`TERMINATE_GRACE`], then SIGKILL.
#[instrument(skip_all, fields(pid = child.id()))]
pub fn terminate_group(child: &mut Child) -> Result<ExitStatus> {
    warn!("terminating child process group");
    signal_group(child, GroupSignal::Terminate);
    if let Some(status) = child
        .wait_timeout(TERMINATE_GRACE)
        .context("wait after terminate")?
    {
        return Ok(status);
    }
    warn!(
        grace_secs = TERMINATE_GRACE.as_secs(),
        "child ignored terminate, killing"
    );
    signal_group(child, GroupSignal::Kill);
    child.wait().context("wait after kill")
}

/// Exit code as reported to callers: the process code, or `-signal` when the
/// process was killed by a signal.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(child: &mut Child, signal: GroupSignal) {
    let signo = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: killpg takes plain integers and has no memory-safety
    // preconditions. The child was spawned with `process_group(0)`, so its
    // pid is also its process group id.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc != 0 {
        debug!(?signal, err = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: GroupSignal) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed");
    }
}
