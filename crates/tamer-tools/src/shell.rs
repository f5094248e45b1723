use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tamer_core::InterruptFlag;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often the child and the interrupt flag are checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for stderr once the child has been killed.
const STDERR_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellRunResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub interrupted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("nothing to run")]
    EmptyCommand,
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error("failed to prepare script: {0}")]
    Script(#[from] std::io::Error),
}

pub trait ShellRunner {
    /// Run `code`, passing each stdout line to `on_stdout_line` as it
    /// arrives. The child is killed once `interrupt` is set.
    fn run_streaming(
        &self,
        code: &str,
        on_stdout_line: &mut dyn FnMut(&str),
        interrupt: &InterruptFlag,
    ) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner {
    cwd: Option<PathBuf>,
}

impl PlatformShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
        }
    }
}

impl ShellRunner for PlatformShellRunner {
    fn run_streaming(
        &self,
        code: &str,
        on_stdout_line: &mut dyn FnMut(&str),
        interrupt: &InterruptFlag,
    ) -> Result<ShellRunResult> {
        if code.trim().is_empty() {
            return Err(ShellError::EmptyCommand.into());
        }
        let script = Script::prepare(code)?;
        let mut child = spawn_command(&script, self.cwd.as_deref())?;
        debug!(pid = child.id(), "command started");

        let (line_tx, line_rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => {
                            debug!(error = %err, "stdout read failed");
                            break;
                        }
                    }
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        let (err_tx, err_rx) = mpsc::channel::<String>();
        if let Some(mut stderr) = child.stderr.take() {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                let _ = err_tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }

        let mut result = ShellRunResult::default();
        let status = loop {
            if interrupt.is_set() {
                result.interrupted = true;
                break kill(&mut child);
            }
            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    on_stdout_line(&line);
                    result.stdout.push_str(&line);
                    result.stdout.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                        break Some(status);
                    }
                }
            }
        };

        result.exit_code = status.and_then(|s| s.code());
        let grace = if result.interrupted {
            STDERR_GRACE
        } else {
            Duration::from_secs(5)
        };
        result.stderr = err_rx.recv_timeout(grace).unwrap_or_default();
        drop(script);
        debug!(
            exit_code = ?result.exit_code,
            interrupted = result.interrupted,
            "command finished"
        );
        Ok(result)
    }
}

fn kill(child: &mut Child) -> Option<ExitStatus> {
    if let Err(err) = child.kill() {
        debug!(error = %err, "kill failed; child already exited");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(error = %err, "failed to reap interrupted command");
            None
        }
    }
}

/// What actually gets executed: the code itself on POSIX, a temporary batch
/// file on Windows. The batch file is removed when this is dropped.
enum Script {
    #[cfg_attr(target_os = "windows", allow(dead_code))]
    Inline(String),
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    Batch(tempfile::TempPath),
}

impl Script {
    #[cfg(not(target_os = "windows"))]
    fn prepare(code: &str) -> Result<Self, ShellError> {
        Ok(Script::Inline(code.to_string()))
    }

    #[cfg(target_os = "windows")]
    fn prepare(code: &str) -> Result<Self, ShellError> {
        use std::io::Write;

        let body = format!(
            "@echo off\r\n{}\r\n",
            code.replace("@echo off", "")
                .replace("pause", "rem pause")
                .replace('\n', "\r\n")
        );
        let mut file = tempfile::Builder::new()
            .prefix("tamer_")
            .suffix(".bat")
            .tempfile()?;
        file.write_all(body.as_bytes())?;
        Ok(Script::Batch(file.into_temp_path()))
    }
}

fn spawn_command(script: &Script, cwd: Option<&Path>) -> Result<Child> {
    let mut errors = Vec::new();
    for mut command in candidate_commands(script) {
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(ShellError::Spawn(errors.join(" | ")).into())
}

#[cfg(target_os = "windows")]
fn candidate_commands(script: &Script) -> Vec<Command> {
    let mut shell = Command::new("cmd");
    match script {
        Script::Batch(path) => shell.arg("/C").arg(path.as_os_str()),
        Script::Inline(code) => shell.arg("/C").arg(code),
    };
    vec![shell]
}

#[cfg(not(target_os = "windows"))]
fn candidate_commands(script: &Script) -> Vec<Command> {
    let code = match script {
        Script::Inline(code) => code.as_str(),
        Script::Batch(path) => path.to_str().unwrap_or_default(),
    };
    let mut commands = Vec::new();
    let mut sh_shell = Command::new("sh");
    sh_shell.arg("-c").arg(code);
    commands.push(sh_shell);

    let mut bash_shell = Command::new("bash");
    bash_shell.arg("-c").arg(code);
    commands.push(bash_shell);

    commands
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn run(code: &str) -> (ShellRunResult, Vec<String>) {
        let mut lines = Vec::new();
        let result = PlatformShellRunner::new()
            .run_streaming(
                code,
                &mut |line: &str| lines.push(line.to_string()),
                &InterruptFlag::new(),
            )
            .expect("run command");
        (result, lines)
    }

    #[test]
    fn streams_stdout_lines_and_collects_stderr() {
        let (result, lines) = run("echo one; echo two; echo oops >&2");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(result.stdout, "one\ntwo\n");
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.interrupted);
    }

    #[test]
    fn invalid_utf8_does_not_cut_off_later_output() {
        let (result, lines) = run("printf 'a\\n\\377\\nb\\n'");
        assert_eq!(
            lines,
            vec!["a".to_string(), "\u{FFFD}".to_string(), "b".to_string()]
        );
        assert_eq!(result.stdout, "a\n\u{FFFD}\nb\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn reports_nonzero_exit_code() {
        let (result, lines) = run("exit 3");
        assert!(lines.is_empty());
        assert_eq!(result.exit_code, Some(3));
    }

    #[test]
    fn multi_line_scripts_run_in_one_shell() {
        let (result, _) = run("X=tamer\necho \"$X\"");
        assert_eq!(result.stdout, "tamer\n");
    }

    #[test]
    fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "x").expect("write");
        let result = PlatformShellRunner::in_dir(dir.path())
            .run_streaming("ls", &mut |_| {}, &InterruptFlag::new())
            .expect("run");
        assert!(result.stdout.contains("marker.txt"));
    }

    #[test]
    fn interrupt_kills_long_running_command() {
        let interrupt = InterruptFlag::new();
        let trigger = interrupt.clone();
        let started = Instant::now();
        let result = PlatformShellRunner::new()
            .run_streaming(
                "echo started; sleep 10",
                &mut |line: &str| {
                    if line == "started" {
                        trigger.set();
                    }
                },
                &interrupt,
            )
            .expect("run");
        assert!(result.interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.stdout, "started\n");
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = PlatformShellRunner::new()
            .run_streaming("   ", &mut |_| {}, &InterruptFlag::new())
            .expect_err("empty");
        assert!(matches!(
            err.downcast_ref::<ShellError>(),
            Some(ShellError::EmptyCommand)
        ));
    }
}
