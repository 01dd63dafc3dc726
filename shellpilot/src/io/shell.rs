//! Persistent interactive shell session with framed, synchronous commands.
//!
//! One shell process lives for the whole run so that working directory,
//! variables, and functions persist between steps. Each command is framed with
//! fresh markers (see [`crate::core::framing`]) and the session reads the
//! merged stdout/stderr stream with `poll(2)` until both markers arrive or the
//! budget runs out. Output beyond `output_limit_bytes` is dropped as it
//! streams in and replaced by a truncation notice.
//!
//! # Timeout policy
//!
//! A timed-out command is interrupted: the session sends `SIGINT` to the
//! shell's process group (the interactive shell survives it, the foreground
//! command normally does not) and drains for `interrupt_grace` until the
//! abandoned call's end marker shows up. If it never does, the marker is kept
//! as *stale* and later calls discard everything through it, so a late
//! trailer cannot leak into another command's output.
//!
//! A call that times out therefore returns after at most
//! `timeout + interrupt_grace`.
//!
//! # Shell death
//!
//! The reader checks the shell's pid between reads, so a shell that exits
//! while a background job still holds the output pipe is reported on the
//! call that killed it, not on the next one.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::controller::CommandRunner;
use crate::core::budget::remaining_budget;
use crate::core::framing::{
    FrameScanner, Markers, discard_through, find, frame_command, parse_exit_code, ready_sentinel,
};
use crate::core::output::clean_bytes;
use crate::core::types::{ExecutionResult, UNPARSED_EXIT_CODE};

const READ_CHUNK: usize = 8192;
const REAP_TIMEOUT: Duration = Duration::from_millis(500);
/// Longest a read waits before checking whether the shell is still alive.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(100);
/// How long to keep reading after the shell exited.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// Failures that make the session unusable for the current call.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The shell did not come up (spawn failed or the readiness sentinel never arrived).
    #[error("shell failed to start: {reason}")]
    Init { reason: String },
    /// `execute` was called after [`ShellSession::close`].
    #[error("shell session is closed")]
    Closed,
}

/// Lifecycle of a [`ShellSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// A startup attempt is in progress or the last one failed.
    Starting,
    Ready,
    Executing,
    /// The shell process exited; the next call restarts it.
    Dead,
    Closed,
}

/// How to spawn the shell process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    pub program: String,
    pub args: Vec<String>,
    /// Value for `TERM`; `dumb` keeps tools from paging or coloring.
    pub term: String,
    pub workdir: Option<PathBuf>,
    pub startup_timeout: Duration,
    /// How long to wait for an interrupted command's trailer after a timeout.
    /// Adds to the caller's timeout when the command ignores `SIGINT`.
    pub interrupt_grace: Duration,
    /// Command output kept per call; the rest is counted and dropped.
    pub output_limit_bytes: usize,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            args: ["--norc", "--noprofile", "--noediting", "-i"]
                .map(String::from)
                .to_vec(),
            term: "dumb".to_string(),
            workdir: None,
            startup_timeout: Duration::from_secs(2),
            interrupt_grace: Duration::from_secs(2),
            output_limit_bytes: 1_000_000,
        }
    }
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Process {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

enum ReadStatus {
    Satisfied,
    TimedOut,
    Eof,
}

/// A live interactive shell that runs one framed command at a time.
pub struct ShellSession {
    options: ShellOptions,
    state: SessionState,
    process: Option<Process>,
    /// Bytes read past the previous call's end marker.
    buffer: Vec<u8>,
    /// End marker of an interrupted call whose trailer has not been seen yet.
    stale_end_marker: Option<String>,
    last_markers: Option<Markers>,
}

impl ShellSession {
    /// Create a session without spawning anything; the first call starts it.
    pub fn new(options: ShellOptions) -> Self {
        Self {
            options,
            state: SessionState::Uninitialized,
            process: None,
            buffer: Vec::new(),
            stale_end_marker: None,
            last_markers: None,
        }
    }

    /// Create a session and start the shell immediately.
    pub fn spawn(options: ShellOptions) -> Result<Self, ShellError> {
        let mut session = Self::new(options);
        session.start()?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(Process::pid)
    }

    /// Markers used by the most recent `execute` call.
    pub fn last_markers(&self) -> Option<&Markers> {
        self.last_markers.as_ref()
    }

    /// Spawn the shell and wait for the readiness sentinel.
    ///
    /// On failure the session stays in [`SessionState::Starting`]; the next
    /// `execute` call makes one more attempt.
    #[instrument(skip_all, fields(program = %self.options.program))]
    pub fn start(&mut self) -> Result<(), ShellError> {
        if self.state == SessionState::Closed {
            return Err(ShellError::Closed);
        }
        self.discard_process();
        self.state = SessionState::Starting;
        self.buffer.clear();
        self.stale_end_marker = None;

        match spawn_shell(&self.options) {
            Ok((process, leftover)) => {
                debug!(pid = process.pid(), "shell ready");
                self.process = Some(process);
                self.buffer = leftover;
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(reason) => {
                error!(%reason, "shell startup failed");
                Err(ShellError::Init { reason })
            }
        }
    }

    /// Run `command` and wait at most `timeout` for its markers.
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ShellError> {
        match self.state {
            SessionState::Closed => return Err(ShellError::Closed),
            SessionState::Ready => {
                if self.process.as_mut().is_some_and(Process::has_exited) {
                    info!("shell exited after the previous command, restarting");
                    self.start()?;
                }
            }
            state => {
                info!(?state, "starting shell before command");
                self.start()?;
            }
        }

        let markers = Markers::generate();
        self.last_markers = Some(markers.clone());
        let Some(process) = self.process.as_mut() else {
            return Err(ShellError::Init {
                reason: "no shell process after startup".to_string(),
            });
        };

        self.state = SessionState::Executing;
        let mut scanner = FrameScanner::new(
            &markers,
            self.stale_end_marker.as_deref(),
            self.options.output_limit_bytes,
        );
        let framed = frame_command(command, &markers);
        if let Err(err) = write_all_flush(&mut process.stdin, framed.as_bytes()) {
            warn!(err = %err, "write to shell failed");
            return Ok(self.on_death(&scanner));
        }

        let deadline = Instant::now() + timeout;
        let status = fill_until(process, &mut self.buffer, deadline, |buf| {
            scanner.advance(buf)
        });
        if !scanner.stale_pending() && self.stale_end_marker.take().is_some() {
            debug!("discarded trailer of interrupted command");
        }

        match status {
            Ok(ReadStatus::Satisfied) => Ok(self.finish(&scanner)),
            Ok(ReadStatus::TimedOut) => Ok(self.on_timeout(scanner, &markers, timeout)),
            Ok(ReadStatus::Eof) => Ok(self.on_death(&scanner)),
            Err(err) => {
                warn!(err = %err, "read from shell failed");
                Ok(self.on_death(&scanner))
            }
        }
    }

    /// Ask the shell to exit, then reap it. Later calls fail with [`ShellError::Closed`].
    pub fn close(&mut self) {
        if let Some(Process {
            mut child,
            mut stdin,
            stdout,
        }) = self.process.take()
        {
            let _ = write_all_flush(&mut stdin, b"exit\n");
            drop(stdin);
            drop(stdout);
            let status = reap(&mut child);
            debug!(status = ?status, "shell closed");
        }
        self.buffer.clear();
        self.stale_end_marker = None;
        self.state = SessionState::Closed;
    }

    fn finish(&mut self, scanner: &FrameScanner) -> ExecutionResult {
        self.state = SessionState::Ready;
        let Some(framed) = scanner.split(&self.buffer) else {
            // fill_until only reports Satisfied once both markers are in.
            let output = clean_bytes(&std::mem::take(&mut self.buffer));
            return ExecutionResult::new(output, UNPARSED_EXIT_CODE);
        };
        self.buffer = framed.leftover;

        let mut output = clean_bytes(&framed.output);
        if scanner.truncated() > 0 {
            warn!(truncated = scanner.truncated(), "command output truncated");
            push_note(
                &mut output,
                &format!("[output truncated: {} bytes omitted]", scanner.truncated()),
            );
        }
        match parse_exit_code(&framed.exit_code_text) {
            Some(code) => {
                debug!(exit_code = code, "command finished");
                ExecutionResult::new(output, code)
            }
            None => {
                warn!(text = %framed.exit_code_text, "unparsable exit code, using 1");
                ExecutionResult {
                    exit_code_unparsed: true,
                    ..ExecutionResult::new(output, UNPARSED_EXIT_CODE)
                }
            }
        }
    }

    fn on_timeout(
        &mut self,
        mut scanner: FrameScanner,
        markers: &Markers,
        timeout: Duration,
    ) -> ExecutionResult {
        warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, interrupting");
        let Some(process) = self.process.as_mut() else {
            return self.on_death(&scanner);
        };
        let interrupted = interrupt_group(process.pid());

        let grace = Instant::now() + self.options.interrupt_grace;
        let drained = fill_until(process, &mut self.buffer, grace, |buf| {
            scanner.advance(buf)
        });

        let captured = match drained {
            Ok(ReadStatus::Satisfied) => {
                self.stale_end_marker = None;
                match scanner.split(&self.buffer) {
                    Some(framed) => {
                        self.buffer = framed.leftover;
                        framed.output
                    }
                    None => std::mem::take(&mut self.buffer),
                }
            }
            Ok(ReadStatus::TimedOut) => {
                debug!("interrupted command did not finish within grace period");
                // Any older stale trailer precedes this one, so one marker covers both.
                self.stale_end_marker = Some(markers.end.clone());
                let output = scanner.partial_output(&self.buffer).to_vec();
                self.buffer.clear();
                output
            }
            Ok(ReadStatus::Eof) | Err(_) => return self.on_death(&scanner),
        };
        self.state = SessionState::Ready;

        let mut output = clean_bytes(&captured);
        if scanner.truncated() > 0 {
            push_note(
                &mut output,
                &format!("[output truncated: {} bytes omitted]", scanner.truncated()),
            );
        }
        let action = if interrupted {
            "sent SIGINT to the shell's process group"
        } else {
            "could not interrupt it"
        };
        push_note(
            &mut output,
            &format!(
                "[command timed out after {:.1}s; {action}]",
                timeout.as_secs_f64()
            ),
        );
        ExecutionResult::timed_out(output)
    }

    fn on_death(&mut self, scanner: &FrameScanner) -> ExecutionResult {
        let mut output = clean_bytes(scanner.partial_output(&self.buffer));
        self.buffer.clear();
        self.stale_end_marker = None;
        self.state = SessionState::Dead;

        let code = match self.process.take() {
            Some(mut process) => reap(&mut process.child).map_or(1, status_code),
            None => 1,
        };
        warn!(exit_code = code, "shell process exited");

        push_note(
            &mut output,
            &format!(
                "[shell exited with status {code}; a new shell will be started for the next command]"
            ),
        );
        ExecutionResult::shell_died(output, code)
    }

    fn discard_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = reap(&mut process.child);
        }
    }
}

impl CommandRunner for ShellSession {
    fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ShellError> {
        ShellSession::execute(self, command, timeout)
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.close();
        }
    }
}

fn push_note(output: &mut String, note: &str) {
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(note);
}

fn spawn_shell(options: &ShellOptions) -> Result<(Process, Vec<u8>), String> {
    let mut cmd = Command::new(&options.program);
    cmd.args(&options.args)
        .env("TERM", &options.term)
        .env("PAGER", "cat")
        .env("GIT_PAGER", "cat")
        .env("PS1", "")
        .env("PS2", "")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // stderr is merged into stdout by the init script.
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(dir) = &options.workdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| format!("spawn {}: {err}", options.program))?;
    drop(cmd);

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = reap(&mut child);
        return Err("shell stdio was not piped".to_string());
    };
    let mut process = Process {
        child,
        stdin,
        stdout,
    };

    match handshake(&mut process, options.startup_timeout) {
        Ok(leftover) => Ok((process, leftover)),
        Err(reason) => {
            let _ = process.child.kill();
            let _ = process.child.wait();
            Err(reason)
        }
    }
}

fn handshake(process: &mut Process, startup_timeout: Duration) -> Result<Vec<u8>, String> {
    let sentinel = ready_sentinel();
    let script = format!(
        "exec 2>&1\n\
         PS1=''; PS2=''; PS0=''\n\
         unset PROMPT_COMMAND HISTFILE MAILCHECK\n\
         set +H +o history 2>/dev/null\n\
         stty -echo 2>/dev/null\n\
         echo '{sentinel}'\n"
    );
    write_all_flush(&mut process.stdin, script.as_bytes())
        .map_err(|err| format!("write init script: {err}"))?;

    let mut buffer = Vec::new();
    let deadline = Instant::now() + startup_timeout;
    let status = fill_until(process, &mut buffer, deadline, |buf| {
        find(buf, sentinel.as_bytes()).is_some()
    })
    .map_err(|err| format!("read shell output: {err}"))?;

    match status {
        ReadStatus::Satisfied => {
            discard_through(&mut buffer, &sentinel);
            Ok(buffer)
        }
        ReadStatus::TimedOut => Err(format!(
            "readiness sentinel not observed within {}ms",
            startup_timeout.as_millis()
        )),
        ReadStatus::Eof => Err("shell exited during startup".to_string()),
    }
}

/// Read chunks into `buffer` until `done` holds, the deadline passes, or the
/// shell goes away.
///
/// The shell counts as gone at EOF or once its pid has exited, whichever is
/// seen first; a background job may keep the pipe open long after the shell
/// itself is dead.
fn fill_until<F>(
    process: &mut Process,
    buffer: &mut Vec<u8>,
    mut deadline: Instant,
    mut done: F,
) -> std::io::Result<ReadStatus>
where
    F: FnMut(&mut Vec<u8>) -> bool,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut exited = false;
    loop {
        if done(buffer) {
            return Ok(ReadStatus::Satisfied);
        }
        if !exited && let Some(status) = process.child.try_wait()? {
            debug!(?status, "shell exited, draining its last output");
            exited = true;
            deadline = deadline.min(Instant::now() + EXIT_DRAIN);
        }
        let Some(budget) = remaining_budget(deadline) else {
            return Ok(if exited {
                ReadStatus::Eof
            } else {
                ReadStatus::TimedOut
            });
        };
        if !wait_readable(&process.stdout, budget.min(LIVENESS_INTERVAL))? {
            if exited {
                return Ok(ReadStatus::Eof);
            }
            continue;
        }
        match process.stdout.read(&mut chunk) {
            Ok(0) => return Ok(ReadStatus::Eof),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Block until `fd` is readable (or hung up) or `budget` elapses.
fn wait_readable<F: AsFd>(fd: &F, budget: Duration) -> std::io::Result<bool> {
    let millis = u16::try_from(budget.as_millis().max(1)).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

fn write_all_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes)?;
    stdin.flush()
}

fn interrupt_group(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => true,
        Err(errno) => {
            warn!(%errno, "failed to interrupt shell process group");
            false
        }
    }
}

/// Wait briefly for the child to exit, killing it if it does not.
fn reap(child: &mut Child) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    match child.wait_timeout(REAP_TIMEOUT) {
        Ok(Some(status)) => Some(status),
        Ok(None) | Err(_) => {
            let _ = child.kill();
            child.wait().ok()
        }
    }
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_secs(10);

    fn session() -> ShellSession {
        ShellSession::spawn(ShellOptions::default()).expect("spawn shell")
    }

    #[test]
    fn echo_round_trip() {
        let mut shell = session();
        let result = shell.execute("echo hello", SHORT).expect("execute");
        assert_eq!(result.output, "hello");
        assert_eq!(result.exit_code, 0);
        assert!(result.success);
        assert_eq!(shell.state(), SessionState::Ready);
    }

    #[test]
    fn non_zero_status_is_reported() {
        let mut shell = session();
        let result = shell.execute("false", SHORT).expect("execute");
        assert_eq!(result.exit_code, 1);
        assert!(!result.success);

        let result = shell.execute("(exit 42)", SHORT).expect("execute");
        assert_eq!(result.exit_code, 42);
    }

    #[test]
    fn exit_reports_status_and_restarts() {
        let mut shell = session();
        let first_pid = shell.pid();

        let result = shell.execute("exit 7", SHORT).expect("execute");
        assert_eq!(result.exit_code, 7);
        assert!(!result.success);
        assert!(result.shell_died);
        assert_eq!(shell.state(), SessionState::Dead);

        let result = shell.execute("echo back", SHORT).expect("reinit");
        assert_eq!(result.output, "back");
        assert_eq!(shell.state(), SessionState::Ready);
        assert_ne!(shell.pid(), first_pid);
    }

    #[test]
    fn timeout_returns_early_and_keeps_session() {
        let mut shell = session();
        let started = Instant::now();
        let result = shell
            .execute("sleep 5", Duration::from_secs(1))
            .expect("execute");
        let elapsed = started.elapsed();

        assert_eq!(result.exit_code, 124);
        assert!(result.timed_out);
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert_eq!(shell.state(), SessionState::Ready);

        let result = shell.execute("echo after", SHORT).expect("execute");
        assert_eq!(result.output, "after");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let mut shell = session();
        let result = shell
            .execute("echo started; sleep 5", Duration::from_secs(1))
            .expect("execute");
        assert!(result.output.starts_with("started"));
        assert_eq!(result.exit_code, 124);
    }

    #[test]
    fn late_trailer_never_reaches_later_output() {
        let mut shell = ShellSession::spawn(ShellOptions {
            interrupt_grace: Duration::from_millis(500),
            ..ShellOptions::default()
        })
        .expect("spawn shell");

        let first = shell
            .execute(
                "bash -c 'trap \"\" INT; sleep 3; echo late'",
                Duration::from_secs(1),
            )
            .expect("first");
        assert!(first.timed_out);
        assert!(shell.stale_end_marker.is_some());

        let second = shell
            .execute("sleep 0.1; echo two", Duration::from_millis(500))
            .expect("second");
        assert!(second.timed_out);
        assert!(!second.output.contains("__EXIT_"), "{:?}", second.output);
        assert!(!second.output.contains("__END_"), "{:?}", second.output);
        assert!(!second.output.contains("late"), "{:?}", second.output);

        let third = shell.execute("echo three", SHORT).expect("third");
        assert_eq!(third.output, "three");
        assert_eq!(third.exit_code, 0);
        assert!(shell.stale_end_marker.is_none());
    }

    #[test]
    fn large_output_is_capped_and_fast() {
        let mut shell = ShellSession::spawn(ShellOptions {
            output_limit_bytes: 64 * 1024,
            ..ShellOptions::default()
        })
        .expect("spawn shell");

        let started = Instant::now();
        let result = shell
            .execute(
                "head -c 8000000 /dev/zero | tr '\\0' a | fold -w 100",
                Duration::from_secs(60),
            )
            .expect("execute");
        let elapsed = started.elapsed();

        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 0);
        assert!(elapsed < Duration::from_secs(20), "took {elapsed:?}");
        assert!(result.output.len() < 128 * 1024);
        let notice = result.output.lines().last().unwrap_or_default();
        assert!(notice.starts_with("[output truncated: "), "{notice}");

        let result = shell.execute("echo after", SHORT).expect("execute");
        assert_eq!(result.output, "after");
    }

    #[test]
    fn exit_with_background_job_is_reported_on_the_same_call() {
        let mut shell = session();
        shell.execute("sleep 20 &", SHORT).expect("background job");

        let started = Instant::now();
        let result = shell.execute("exit 3", SHORT).expect("exit");
        assert!(result.shell_died, "{result:?}");
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 3);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(shell.state(), SessionState::Dead);

        let result = shell.execute("echo hi", SHORT).expect("next");
        assert_eq!(result.output, "hi");
        assert!(!result.shell_died);
    }

    #[test]
    fn clean_exit_of_the_shell_is_not_success() {
        let mut shell = session();
        let result = shell.execute("exit", SHORT).expect("execute");
        assert!(result.shell_died);
        assert_eq!(result.exit_code, 1);
        assert!(!result.success);
    }

    #[test]
    fn markers_change_every_call() {
        let mut shell = session();
        shell.execute("true", SHORT).expect("first");
        let first = shell.last_markers().cloned().expect("markers");
        shell.execute("true", SHORT).expect("second");
        let second = shell.last_markers().cloned().expect("markers");
        assert_ne!(first, second);
    }

    #[test]
    fn leftover_is_prefix_of_next_call() {
        let mut shell = session();
        shell.execute("echo one", SHORT).expect("first");
        let markers = shell.last_markers().cloned().expect("markers");
        let leftover = String::from_utf8_lossy(&shell.buffer).to_string();
        assert!(!leftover.contains(&markers.end));

        shell.buffer.extend_from_slice(b"stray\n");
        let result = shell.execute("echo two", SHORT).expect("second");
        assert_eq!(result.output, "stray\ntwo");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn state_persists_between_calls() {
        let mut shell = session();
        shell
            .execute("export SHELLPILOT_PROBE=kept", SHORT)
            .expect("export");
        let result = shell
            .execute("echo $SHELLPILOT_PROBE", SHORT)
            .expect("echo");
        assert_eq!(result.output, "kept");
    }

    #[test]
    fn stderr_is_captured() {
        let mut shell = session();
        let result = shell
            .execute("echo oops >&2; exit_status_probe_missing_cmd", SHORT)
            .expect("execute");
        assert!(result.output.contains("oops"));
        assert_eq!(result.exit_code, 127);
    }

    #[test]
    fn output_is_cleaned() {
        let mut shell = session();
        let result = shell
            .execute("printf '\\033[31mred\\033[0m   \\n\\n  indented\\n'", SHORT)
            .expect("execute");
        assert_eq!(result.output, "red\n  indented");
    }

    #[test]
    fn output_without_trailing_newline() {
        let mut shell = session();
        let result = shell.execute("printf abc", SHORT).expect("execute");
        assert_eq!(result.output, "abc");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn unparsable_exit_code_defaults_to_one() {
        let mut shell = session();
        let result = shell.execute("readonly EC", SHORT).expect("execute");
        assert!(result.exit_code_unparsed);
        assert_eq!(result.exit_code, 1);
        assert!(!result.success);
    }

    #[test]
    fn workdir_is_respected() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let mut shell = ShellSession::spawn(ShellOptions {
            workdir: Some(temp.path().to_path_buf()),
            ..ShellOptions::default()
        })
        .expect("spawn");
        let result = shell.execute("ls", SHORT).expect("execute");
        assert_eq!(result.output, "marker.txt");
    }

    #[test]
    fn missing_program_is_init_error() {
        let err = ShellSession::spawn(ShellOptions {
            program: "/nonexistent/shellpilot-shell".to_string(),
            ..ShellOptions::default()
        })
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, ShellError::Init { .. }));
    }

    #[test]
    fn shell_that_exits_is_init_error_and_stays_starting() {
        let mut shell = ShellSession::new(ShellOptions {
            program: "true".to_string(),
            args: Vec::new(),
            ..ShellOptions::default()
        });
        let err = shell.start().unwrap_err();
        assert!(matches!(err, ShellError::Init { .. }));
        assert_eq!(shell.state(), SessionState::Starting);

        let err = shell.execute("echo hi", SHORT).unwrap_err();
        assert!(matches!(err, ShellError::Init { .. }));
    }

    #[test]
    fn reinit_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flag = temp.path().join("started");
        let script = format!(
            "if [ -e '{flag}' ]; then exit 1; fi; touch '{flag}'; exec bash --norc --noprofile --noediting -i",
            flag = flag.display()
        );
        let mut shell = ShellSession::spawn(ShellOptions {
            args: vec!["-c".to_string(), script],
            ..ShellOptions::default()
        })
        .expect("first start");

        let died = shell.execute("exit 3", SHORT).expect("execute");
        assert!(died.shell_died);
        assert_eq!(died.exit_code, 3);

        let err = shell.execute("echo again", SHORT).unwrap_err();
        assert!(matches!(err, ShellError::Init { .. }));
    }

    #[test]
    fn closed_session_rejects_commands() {
        let mut shell = session();
        shell.close();
        assert_eq!(shell.state(), SessionState::Closed);
        let err = shell.execute("echo hi", SHORT).unwrap_err();
        assert!(matches!(err, ShellError::Closed));
    }

    #[test]
    fn lazy_session_starts_on_first_call() {
        let mut shell = ShellSession::new(ShellOptions::default());
        assert_eq!(shell.state(), SessionState::Uninitialized);
        let result = shell.execute("echo lazy", SHORT).expect("execute");
        assert_eq!(result.output, "lazy");
    }
}
