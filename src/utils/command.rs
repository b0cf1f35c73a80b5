//! Command execution primitives with consistent error handling.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Captured result of one external process invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Prefer stderr for diagnostics, fall back to stdout.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Run a command and return stdout on success.
///
/// Returns trimmed stdout if the command succeeds.
/// Returns an error with stderr (or stdout fallback) if it fails.
pub fn run(program: &str, args: &[&str], context: &str) -> Result<String> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        Error::internal_io(format!("Failed to run {}: {}", context, e))
    })?;

    if !output.status.success() {
        return Err(Error::internal_io(format!(
            "{} failed: {}",
            context,
            stderr_or_stdout(&output)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command in a specific directory.
pub fn run_in(dir: &Path, program: &str, args: &[&str], context: &str) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::internal_io(format!("Failed to run {}: {}", context, e)))?;

    if !output.status.success() {
        return Err(Error::internal_io(format!(
            "{} failed: {}",
            context,
            stderr_or_stdout(&output)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a shell command with a hard wall-clock timeout.
///
/// Build and test tooling can hang indefinitely; the deadline kills the
/// child process and surfaces a distinct timeout error. Pipes are drained
/// on background threads so a chatty child cannot deadlock on a full pipe
/// while we poll for exit.
pub fn run_with_timeout(
    command: &str,
    current_dir: Option<&Path>,
    timeout: Duration,
    context: &str,
) -> Result<CommandOutput> {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::internal_io(format!("Failed to run {}: {}", context, e)))?;

    let stdout_handle = drain_pipe(child.stdout.take());
    let stderr_handle = drain_pipe(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    // Best effort; the child may have exited in the meantime
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::runner_command_timeout(context, timeout.as_secs()));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::internal_io(format!(
                    "Failed waiting on {}: {}",
                    context, e
                )));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr,
        success: status.success(),
        exit_code: status.code().unwrap_or(-1),
    })
}

fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut reader) = pipe {
            let mut bytes = Vec::new();
            if reader.read_to_end(&mut bytes).is_ok() {
                buf = String::from_utf8_lossy(&bytes).to_string();
            }
        }
        buf
    })
}

fn stderr_or_stdout(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}
