use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::config::Server;
use crate::error::{Error, Result};
use crate::utils::command::CommandOutput;

/// Chunk size for piping artifacts into a remote command's stdin.
const STREAM_CHUNK_BYTES: usize = 1024 * 1024;

/// Opens authenticated sessions to the target host.
///
/// Trait seam so the orchestrator can be tested against a fake transport
/// that counts opens/closes and scripts command outcomes.
pub trait RemoteTransport: Send + Sync {
    fn connect(&self, server: &Server, timeout: Duration) -> Result<Box<dyn RemoteSession>>;
}

/// A live logical connection to exactly one target host, owned exclusively
/// by the run that opened it and closed exactly once on every exit path.
pub trait RemoteSession: Send {
    /// Execute a remote command, delivering stdout lines incrementally
    /// through `on_line` so callers can surface progress in near real time.
    fn execute(
        &mut self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput>;

    /// Pipe a local file into the remote command's standard input without
    /// materializing it on the remote filesystem. `progress` receives
    /// (cumulative bytes sent, total bytes). Returns bytes sent.
    fn stream_file(
        &mut self,
        command: &str,
        local_path: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64>;

    fn close(&mut self);
}

impl std::fmt::Debug for dyn RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteSession")
    }
}

pub struct SshTransport;

impl RemoteTransport for SshTransport {
    fn connect(&self, server: &Server, timeout: Duration) -> Result<Box<dyn RemoteSession>> {
        if !server.is_valid() {
            return Err(Error::ssh_server_invalid(
                "Server config needs host and user",
            ));
        }

        let identity_file = server.resolved_identity_file()?;
        let is_local = is_local_host(&server.host);
        if is_local {
            log_status!("ssh", "Target '{}' is localhost, using local execution", server.host);
        }

        let session = SshSession {
            host: server.host.clone(),
            user: server.user.clone(),
            port: server.port,
            identity_file,
            connect_timeout_secs: timeout.as_secs().max(1),
            is_local,
            closed: false,
        };

        // Probe the connection up front so auth and reachability problems
        // surface before the pipeline commits to remote phases.
        if !is_local {
            session.probe()?;
        }

        log_status!("ssh", "Session open to {}@{}", server.user, server.host);
        Ok(Box::new(session))
    }
}

/// Remote command session over the system `ssh` binary.
///
/// Each command runs as its own `ssh` invocation against the
/// probe-validated endpoint; the session is logical and carries the
/// run-scoped ownership contract rather than a persistent socket.
pub struct SshSession {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<String>,
    connect_timeout_secs: u64,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the server host is localhost/127.0.0.1/::1.
    is_local: bool,
    closed: bool,
}

impl SshSession {
    fn build_ssh_args(&self, command: Option<&str>, force_tty: bool) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Timeout and keepalive options prevent hangs on stalled
        // connections or unexpected prompts.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        // Some remote tools only stay live when given a pseudo-terminal
        if force_tty {
            args.push("-tt".to_string());
        }

        args.push(format!("{}@{}", self.user, self.host));

        if let Some(cmd) = command {
            args.push(cmd.to_string());
        }

        args
    }

    /// Sessions are owned by exactly one run and closed on every exit
    /// path; commands after close are a caller bug, not a retry path.
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::internal_io(format!(
                "Session to {}@{} is already closed",
                self.user, self.host
            )));
        }
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        let args = self.build_ssh_args(Some("true"), false);
        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::ssh_connect_failed(&self.host, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let lowered = stderr.to_lowercase();
        if lowered.contains("permission denied") || lowered.contains("authentication") {
            return Err(Error::ssh_auth_failed(&self.host));
        }
        Err(Error::ssh_connect_failed(&self.host, stderr.trim().to_string()))
    }

    fn spawn(&self, command: &str, force_tty: bool, stdin: Stdio) -> Result<Child> {
        let mut cmd = if self.is_local {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("ssh");
            cmd.args(self.build_ssh_args(Some(command), force_tty));
            cmd
        };

        cmd.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ssh_connect_failed(&self.host, e.to_string()))
    }
}

impl RemoteSession for SshSession {
    fn execute(
        &mut self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        self.ensure_open()?;
        let mut child = self.spawn(command, false, Stdio::null())?;

        let stderr_handle = drain_to_string(child.stderr.take());

        let mut stdout = String::new();
        if let Some(pipe) = child.stdout.take() {
            let reader = BufReader::new(pipe);
            for line in reader.lines() {
                let line = line.map_err(|e| Error::internal_io(e.to_string()))?;
                on_line(&line);
                stdout.push_str(&line);
                stdout.push('\n');
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::internal_io(e.to_string()))?;
        let stderr = stderr_handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();

        Ok(CommandOutput {
            stdout,
            stderr,
            success: status.success(),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    fn stream_file(
        &mut self,
        command: &str,
        local_path: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64> {
        self.ensure_open()?;
        let mut file = std::fs::File::open(local_path).map_err(|e| {
            Error::internal_io(format!(
                "Failed to open artifact {}: {}",
                local_path.display(),
                e
            ))
        })?;
        let total = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::internal_io(e.to_string()))?;

        let mut child = self.spawn(command, false, Stdio::piped())?;

        let stdout_handle = drain_to_string(child.stdout.take());
        let stderr_handle = drain_to_string(child.stderr.take());

        let mut sent: u64 = 0;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::internal_io("Remote command stdin unavailable"))?;
            let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];
            loop {
                let n = file
                    .read(&mut chunk)
                    .map_err(|e| Error::internal_io(format!("Artifact read failed: {}", e)))?;
                if n == 0 {
                    break;
                }
                if let Err(e) = stdin.write_all(&chunk[..n]) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::internal_io(format!(
                        "Mid-stream write failed after {} bytes: {}",
                        sent, e
                    )));
                }
                sent += n as u64;
                progress(sent, total);
            }
            // Dropping stdin sends EOF so the remote command can finish
        }

        let status = child
            .wait()
            .map_err(|e| Error::internal_io(e.to_string()))?;
        let stderr = stderr_handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        // Remote stdout is not interesting for loads; drain to avoid blocking
        let _ = stdout_handle.map(|h| h.join());

        if !status.success() {
            return Err(Error::remote_command_failed(
                command,
                status.code().unwrap_or(-1),
                stderr.trim(),
            ));
        }

        Ok(sent)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log_status!("ssh", "Session closed for {}@{}", self.user, self.host);
        }
    }
}

fn drain_to_string<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> Option<std::thread::JoinHandle<String>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).to_string()
        })
    })
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
