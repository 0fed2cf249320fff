//! Deadline-bounded command execution
//!
//! This module is the only place step actions and verification checks are
//! spawned. Every command:
//!
//! - Runs in its own process group (see `process_guard`), registered for cleanup
//! - Has stdin closed and stdout/stderr captured
//! - Is cancelled hard at its deadline: SIGTERM to the group, then SIGKILL
//!   after a short grace period

use crate::process_guard::{self, CommandProcessGroup};
use crate::registry::CommandSpec;
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Time between SIGTERM and SIGKILL when a command overruns its deadline
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Polling interval while waiting for a command to exit
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for output pipes after the command itself exited
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Longest stderr/stdout tail kept in a failure reason
const REASON_TAIL: usize = 400;

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the exit code is one of the command's accepted codes.
    pub success: bool,
    /// Whether the command was killed at its deadline.
    pub timed_out: bool,
    /// Wall-clock runtime.
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Check if the command succeeded and return an error describing why not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        if self.timed_out {
            anyhow::bail!(
                "{} timed out after {:.1}s and was killed",
                context,
                self.elapsed.as_secs_f64()
            );
        }
        let detail = self.failure_detail();
        match self.exit_code {
            Some(code) if detail.is_empty() => {
                anyhow::bail!("{} failed (exit code {})", context, code)
            }
            Some(code) => anyhow::bail!("{} failed (exit code {}): {}", context, code, detail),
            None if detail.is_empty() => {
                anyhow::bail!("{} was terminated by a signal", context)
            }
            None => anyhow::bail!("{} was terminated by a signal: {}", context, detail),
        }
    }

    /// Tail of stderr, falling back to stdout when stderr is empty
    fn failure_detail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        tail(source, REASON_TAIL)
    }
}

/// Run `spec`, killing its process group if it is still running after `timeout`.
///
/// # Errors
///
/// Only when the command cannot be started or waited on. A non-zero exit or a
/// timeout is reported through [`CommandOutput`], not as an error.
pub fn run_command(spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
    info!(
        "run_command: {} cwd={:?} env={:?} timeout={:?}",
        spec.display_line(),
        spec.cwd,
        spec.env.keys().collect::<Vec<_>>(),
        timeout
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to start '{}'", spec.display_line()))?;
    let pid = child.id();
    process_guard::register_child(pid);

    feed_stdin(child.stdin.take(), spec.stdin.clone());
    let stdout_rx = drain_pipe(child.stdout.take());
    let stderr_rx = drain_pipe(child.stderr.take());

    // A timeout too large to represent as an instant means no deadline
    let deadline = start.checked_add(timeout);
    let waited = wait_with_deadline(&mut child, deadline);
    process_guard::unregister_child(pid);
    let (status, timed_out) =
        waited.with_context(|| format!("Failed waiting for '{}'", spec.display_line()))?;

    let stdout = stdout_rx.recv_timeout(PIPE_DRAIN).unwrap_or_default();
    let stderr = stderr_rx.recv_timeout(PIPE_DRAIN).unwrap_or_default();
    let exit_code = status.code();
    let success = !timed_out && exit_code.is_some_and(|code| spec.accepts(code));
    let elapsed = start.elapsed();

    if success {
        debug!("'{}' finished in {:?}", spec.display_line(), elapsed);
    } else if timed_out {
        warn!("'{}' killed after {:?} (deadline {:?})", spec.display_line(), elapsed, timeout);
    } else {
        info!("'{}' failed with exit code {:?}", spec.display_line(), exit_code);
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        success,
        timed_out,
        elapsed,
    })
}

/// Poll until the child exits or the deadline passes; on deadline the whole
/// group is terminated. Returns the exit status and whether it timed out.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> std::io::Result<(ExitStatus, bool)> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let pid = child.id();
    if let Err(e) = process_guard::send_signal_to_group(pid, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pid, e);
    }
    let grace_end = Instant::now() + KILL_GRACE;
    while Instant::now() < grace_end {
        if let Some(status) = child.try_wait()? {
            return Ok((status, true));
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
    if process_guard::send_signal_to_group(pid, Signal::SIGKILL).is_err() {
        child.kill()?;
    }
    Ok((child.wait()?, true))
}

/// Write `input` to the child's stdin on a helper thread, then close it.
/// A child that never reads must not block the caller on a full pipe.
fn feed_stdin(pipe: Option<ChildStdin>, input: Option<String>) {
    let (Some(mut pipe), Some(input)) = (pipe, input) else {
        return;
    };
    thread::spawn(move || {
        if let Err(e) = pipe.write_all(input.as_bytes()) {
            debug!("Writing stdin failed: {}", e);
        }
    });
}

/// Read a pipe to the end on a helper thread. Background processes that keep
/// the pipe open must not hang the caller, so the result arrives on a channel.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

/// Last `max` characters of `s`, prefixed with an ellipsis when cut
pub fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let cut: String = s.chars().skip(count - max).collect();
    format!("…{}", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_command_success_captures_stdout() {
        let out = run_command(&CommandSpec::shell("echo hello"), Duration::from_secs(5)).unwrap();
        assert!(out.success);
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.ensure_success("echo").is_ok());
    }

    #[test]
    fn test_run_command_failure_reports_stderr() {
        let spec = CommandSpec::shell("echo 'disk not mounted' >&2; exit 3");
        let out = run_command(&spec, Duration::from_secs(5)).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));

        let msg = out.ensure_success("restore").unwrap_err().to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("disk not mounted"), "{msg}");
    }

    #[test]
    fn test_accepted_nonzero_exit_is_success() {
        let spec = CommandSpec::shell("exit 100").success_codes(vec![0, 100]);
        let out = run_command(&spec, Duration::from_secs(5)).unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(100));
    }

    #[test]
    fn test_timeout_kills_command() {
        let spec = CommandSpec::shell("sleep 30");
        let out = run_command(&spec, Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(out.elapsed < Duration::from_secs(10));
        let msg = out.ensure_success("sleepy").unwrap_err().to_string();
        assert!(msg.contains("timed out"), "{msg}");
    }

    #[test]
    fn test_unrepresentable_timeout_means_no_deadline() {
        let out = run_command(&CommandSpec::new("true"), Duration::MAX).unwrap();
        assert!(out.success);
        assert!(!out.timed_out);
    }

    #[test]
    fn test_stdin_payload_is_delivered() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("homebox.repo");
        let spec = CommandSpec::new("tee")
            .arg(target.display().to_string())
            .stdin("[homebox]\nbaseurl=https://example.invalid\n");
        let out = run_command(&spec, Duration::from_secs(5)).unwrap();
        assert!(out.success);
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written, "[homebox]\nbaseurl=https://example.invalid\n");
    }

    #[test]
    fn test_no_stdin_reads_eof() {
        let out = run_command(&CommandSpec::new("cat"), Duration::from_secs(5)).unwrap();
        assert!(out.success);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn test_timeout_kills_whole_group() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let out = run_command(&CommandSpec::shell(script), Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    #[test]
    fn test_cwd_and_env_are_applied() {
        let dir = TempDir::new().unwrap();
        let spec = CommandSpec::shell("pwd; echo \"$HOMEBOX_TEST_VAR\"")
            .cwd(dir.path())
            .env("HOMEBOX_TEST_VAR", "vimes");
        let out = run_command(&spec, Duration::from_secs(5)).unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(lines[0]).canonicalize().unwrap(), expected);
        assert_eq!(lines[1], "vimes");
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let spec = CommandSpec::new("definitely-not-a-real-program-homebox");
        let err = run_command(&spec, Duration::from_secs(1)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to start"));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abc", 5), "abc");
        assert_eq!(tail("abcdef", 3), "…def");
    }
}
