use shell_escape::unix::escape;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::CommandExecutionError;
use crate::logger::Logger;

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the command attached to an execute-directive task.
pub(crate) trait CommandExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, CommandExecutionError>;
}

#[derive(Debug, Clone)]
pub(crate) struct ShellExecutor {
    pub(crate) timeout: Duration,
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, CommandExecutionError> {
        run_shell_command_capture(command, &[], self.timeout)
    }
}

/// Logs start and exit of a command in the transition log around `run`.
pub(crate) fn logged<F>(
    logger: &Logger,
    label: &str,
    command: &str,
    run: F,
) -> Result<CommandOutput, CommandExecutionError>
where
    F: FnOnce() -> Result<CommandOutput, CommandExecutionError>,
{
    logger.log_transition(&format!(
        "cmd start label={} mode=bash_lc command={}",
        label,
        escape(command.into())
    ));
    let result = run();
    match &result {
        Ok(output) => logger.log_transition(&format!(
            "cmd exit label={} exit={}",
            label, output.exit_code
        )),
        Err(err) => logger.log_transition(&format!("cmd failed label={} err={}", label, err)),
    }
    result
}

/// Runs `command` through `bash -lc`, capturing stdout and stderr. The child is
/// killed once `timeout` elapses.
pub(crate) fn run_shell_command_capture(
    command: &str,
    env: &[(&str, String)],
    timeout: Duration,
) -> Result<CommandOutput, CommandExecutionError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-lc").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn().map_err(|source| CommandExecutionError::Launch {
        command: command.to_string(),
        source,
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_with_deadline(&mut child, timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            // Grandchildren may still hold the pipes open, so the readers are left detached.
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandExecutionError::Timeout {
                command: command.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandExecutionError::Launch {
                command: command.to_string(),
                source,
            });
        }
    };

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        exit_code: status.code().unwrap_or(1),
    })
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(timeout_ms: u64) -> ShellExecutor {
        ShellExecutor {
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let output = executor(5000)
            .execute("echo out; echo err >&2; exit 3")
            .expect("run");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[test]
    fn passes_environment() {
        let output = run_shell_command_capture(
            "printf '%s' \"$TASKY_NOTIFICATION_TITLE\"",
            &[("TASKY_NOTIFICATION_TITLE", "Tasky:".to_string())],
            Duration::from_secs(5),
        )
        .expect("run");
        assert_eq!(output.stdout, "Tasky:");
    }

    #[test]
    fn slow_command_is_killed_at_timeout() {
        let started = Instant::now();
        let err = executor(100).execute("sleep 5").expect_err("timeout");
        assert!(matches!(err, CommandExecutionError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
