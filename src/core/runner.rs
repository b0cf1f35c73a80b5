use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::service::ServiceDescriptor;
use crate::utils::command::{self, CommandOutput};
use crate::utils::shell;

/// Local build, test, and packaging operations.
///
/// Every operation is a bounded-time external-process invocation; the
/// production implementation shells out to the test command and `docker`.
pub trait BuildRunner: Send + Sync {
    /// Run the service's declared test command. Ok(false) means the gate
    /// failed; Err means the tooling itself could not run.
    fn run_tests(&self, service: &ServiceDescriptor, build_context: &Path) -> Result<bool>;

    /// Run the configured quality gate command.
    fn run_quality_gate(
        &self,
        service: &ServiceDescriptor,
        build_context: &Path,
        gate_command: &str,
    ) -> Result<bool>;

    fn build_image(&self, service: &ServiceDescriptor, build_context: &Path) -> Result<()>;

    /// Export the built image to `dest`. Leaves exactly one artifact file
    /// there on success and returns its size in bytes; the caller owns
    /// deleting it after transfer.
    fn export_artifact(&self, service: &ServiceDescriptor, dest: &Path) -> Result<u64>;
}

pub struct DockerRunner {
    command_timeout: Duration,
}

impl DockerRunner {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl BuildRunner for DockerRunner {
    fn run_tests(&self, service: &ServiceDescriptor, build_context: &Path) -> Result<bool> {
        let Some(test_command) = &service.test_command else {
            return Ok(true);
        };
        log_status!("gate", "Running tests for '{}': {}", service.name, test_command);
        let output = command::run_with_timeout(
            test_command,
            Some(build_context),
            self.command_timeout,
            "tests",
        )?;
        if !output.success {
            log_status!("gate", "{}", failure_tail("Tests", &service.name, &output));
        }
        Ok(output.success)
    }

    fn run_quality_gate(
        &self,
        service: &ServiceDescriptor,
        build_context: &Path,
        gate_command: &str,
    ) -> Result<bool> {
        log_status!("gate", "Running quality gate for '{}'", service.name);
        let output = command::run_with_timeout(
            gate_command,
            Some(build_context),
            self.command_timeout,
            "quality gate",
        )?;
        if !output.success {
            log_status!("gate", "{}", failure_tail("Quality gate", &service.name, &output));
        }
        Ok(output.success)
    }

    fn build_image(&self, service: &ServiceDescriptor, build_context: &Path) -> Result<()> {
        let build_cmd = format!("docker build -t {} .", shell::quote_arg(&service.image_ref));
        log_status!("build", "Building image {} from {}", service.image_ref, build_context.display());
        let output = command::run_with_timeout(
            &build_cmd,
            Some(build_context),
            self.command_timeout,
            "docker build",
        )?;
        if !output.success {
            return Err(Error::build_image_failed(
                &service.name,
                failure_tail("Build", &service.name, &output),
            ));
        }
        Ok(())
    }

    fn export_artifact(&self, service: &ServiceDescriptor, dest: &Path) -> Result<u64> {
        let save_cmd = format!(
            "docker save -o {} {}",
            shell::quote_path(&dest.to_string_lossy()),
            shell::quote_arg(&service.image_ref),
        );
        let output =
            command::run_with_timeout(&save_cmd, None, self.command_timeout, "docker save")?;
        if !output.success {
            return Err(Error::build_export_failed(
                &service.name,
                failure_tail("Export", &service.name, &output),
            ));
        }
        let size = std::fs::metadata(dest)
            .map(|m| m.len())
            .map_err(|e| {
                Error::build_export_failed(
                    &service.name,
                    format!("artifact missing at {}: {}", dest.display(), e),
                )
            })?;
        Ok(size)
    }
}

/// Format a failure message with the last lines of process output.
fn failure_tail(phase: &str, service: &str, output: &CommandOutput) -> String {
    let text = output.error_text();
    let tail: Vec<&str> = text.lines().rev().take(15).collect();
    let tail: String = tail.into_iter().rev().collect::<Vec<_>>().join("\n");

    let mut msg = format!(
        "{} failed for '{}' (exit code {})",
        phase, service, output.exit_code
    );
    if !tail.trim().is_empty() {
        msg.push_str(": ");
        msg.push_str(tail.trim());
    }
    msg
}
