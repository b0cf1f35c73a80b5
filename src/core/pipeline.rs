use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::git::{GitCli, SourceControl};
use crate::logsink::LogSink;
use crate::runner::{BuildRunner, DockerRunner};
use crate::service::ServiceDescriptor;
use crate::ssh::{RemoteSession, RemoteTransport, SshTransport};
use crate::utils::shell;

/// Read-only remote inspection for `CHECK_STATUS`.
const STATUS_COMMAND: &str =
    "docker ps --format 'table {{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}'";

/// Blanket resource reclamation for `CLEAN_TARGET`.
const CLEAN_COMMAND: &str = "docker system prune -f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    CheckStatus,
    CleanTarget,
    FullDeploy,
}

impl PipelineAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineAction::CheckStatus => "check_status",
            PipelineAction::CleanTarget => "clean_target",
            PipelineAction::FullDeploy => "full_deploy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    Gating,
    Building,
    CleaningTarget,
    Transferring,
    Starting,
    Succeeded,
    RolledBack,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Fetching => "fetching",
            PipelineState::Gating => "gating",
            PipelineState::Building => "building",
            PipelineState::CleaningTarget => "cleaning_target",
            PipelineState::Transferring => "transferring",
            PipelineState::Starting => "starting",
            PipelineState::Succeeded => "succeeded",
            PipelineState::RolledBack => "rolled_back",
            PipelineState::Failed => "failed",
        }
    }
}

/// Per-invocation capability resolved by the caller's identity layer.
/// Anything beyond a status check requires mutate rights.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub can_mutate: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub action: String,
    pub state: PipelineState,
    pub success: bool,
}

/// Outcome of the best-effort rollback sub-machine: sub-failures are
/// logged, never promoted to fatal errors, but a partial rollback stays
/// distinguishable from a complete one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Done,
    Partial,
}

impl RollbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackOutcome::Done => "done",
            RollbackOutcome::Partial => "partial",
        }
    }
}

enum GateKind {
    Tests,
    Quality,
}

struct BuiltArtifact {
    service: ServiceDescriptor,
    path: PathBuf,
    size: u64,
}

/// Releases the single execution slot when the run settles, including on
/// panic paths, so a wedged phase cannot block the next run forever.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives one deployment request through fetch, gate, build, and remote
/// replacement, with a process-wide single execution slot.
pub struct Orchestrator {
    config: AppConfig,
    transport: Arc<dyn RemoteTransport>,
    runner: Arc<dyn BuildRunner>,
    source: Arc<dyn SourceControl>,
    sink: Arc<LogSink>,
    in_flight: AtomicBool,
    last_stable_revision: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig) -> Self {
        let command_timeout = config.command_timeout();
        Self::with_collaborators(
            config,
            Arc::new(SshTransport),
            Arc::new(DockerRunner::new(command_timeout)),
            Arc::new(GitCli),
        )
    }

    pub fn with_collaborators(
        config: AppConfig,
        transport: Arc<dyn RemoteTransport>,
        runner: Arc<dyn BuildRunner>,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            config,
            transport,
            runner,
            source,
            sink: Arc::new(LogSink::new()),
            in_flight: AtomicBool::new(false),
            last_stable_revision: Mutex::new(None),
        }
    }

    /// Observation surface: the most recent run's buffer, empty before
    /// the first run.
    pub fn read_logs(&self) -> Vec<String> {
        self.sink.snapshot()
    }

    /// Rollback point captured by the most recent deploy, if any.
    pub fn last_stable_revision(&self) -> Option<String> {
        self.last_stable_revision
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    /// Single entry point for all trigger surfaces.
    ///
    /// Rejection order: authorization before any state transition, then
    /// the single-flight slot. Requests arriving while a run is active
    /// are rejected immediately, never queued.
    pub fn invoke(
        &self,
        action: PipelineAction,
        repo_url: &str,
        repo_name: &str,
        capability: &Capability,
    ) -> Result<RunReport> {
        if action != PipelineAction::CheckStatus && !capability.can_mutate {
            return Err(Error::auth_mutation_denied(action.as_str()));
        }

        let _slot = self.acquire_slot()?;

        self.sink.reset();
        let run_id = Uuid::new_v4().to_string();
        self.sink
            .append(format!("run {} started: action={}", run_id, action.as_str()));
        log_status!("pipeline", "Run {} started ({})", run_id, action.as_str());

        let state = match action {
            PipelineAction::CheckStatus => self.run_admin(STATUS_COMMAND, "status")?,
            PipelineAction::CleanTarget => self.run_admin(CLEAN_COMMAND, "clean")?,
            PipelineAction::FullDeploy => self.run_deploy(repo_url, repo_name)?,
        };

        self.sink
            .append(format!("run {} finished: {}", run_id, state.as_str()));
        Ok(RunReport {
            run_id,
            action: action.as_str().to_string(),
            state,
            success: true,
        })
    }

    fn acquire_slot(&self) -> Result<FlightGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(FlightGuard(&self.in_flight))
        } else {
            Err(Error::pipeline_busy())
        }
    }

    fn transition(&self, state: PipelineState) {
        self.sink.append(format!("state -> {}", state.as_str()));
        log_status!("pipeline", "State -> {}", state.as_str());
    }

    /// Log a fatal phase error and mark the run's terminal state.
    fn fail(&self, err: Error) -> Error {
        self.sink
            .append(format!("run failed [{}]: {}", err.code.as_str(), err.message));
        err.with_terminal_state("failed")
    }

    fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        self.transport
            .connect(&self.config.server, self.config.connect_timeout())
    }

    /// `CHECK_STATUS` / `CLEAN_TARGET`: open a session, run one fixed
    /// command, close the session. Never touches the working tree or the
    /// recorded stable revision.
    fn run_admin(&self, command: &str, label: &str) -> Result<PipelineState> {
        self.sink.append(format!(
            "{}: connecting to {}@{}",
            label, self.config.server.user, self.config.server.host
        ));
        let mut session = self.connect().map_err(|e| self.fail(e))?;

        self.sink.append(format!("{}: running '{}'", label, command));
        let sink = Arc::clone(&self.sink);
        let result = session.execute(command, &mut |line| sink.append(format!("remote: {}", line)));

        session.close();
        self.sink.append("remote session closed");

        let output = result.map_err(|e| self.fail(e))?;
        if !output.success {
            return Err(self.fail(Error::remote_command_failed(
                command,
                output.exit_code,
                output.stderr.trim(),
            )));
        }

        self.sink.append(format!("{} completed", label));
        Ok(PipelineState::Succeeded)
    }

    fn run_deploy(&self, repo_url: &str, repo_name: &str) -> Result<PipelineState> {
        if repo_url.is_empty() || repo_name.is_empty() {
            return Err(self.fail(Error::config_invalid_value(
                "repository",
                "repoUrl and repoName are required for a full deploy",
            )));
        }

        // FETCHING
        self.transition(PipelineState::Fetching);
        let checkout = self.config.checkout_dir(repo_name);
        std::fs::create_dir_all(self.config.workspace_dir()).map_err(|e| {
            self.fail(Error::internal_io(format!(
                "Failed to create workspace: {}",
                e
            )))
        })?;

        // Rollback point, captured strictly before the tree mutates
        let last_stable = self.source.current_revision(&checkout);
        if let Ok(mut slot) = self.last_stable_revision.lock() {
            *slot = last_stable.clone();
        }
        match &last_stable {
            Some(rev) => self.sink.append(format!("last stable revision: {}", rev)),
            None => self.sink.append("no existing checkout, fresh clone"),
        }

        self.source
            .sync(repo_url, &checkout)
            .map_err(|e| self.fail(e))?;
        self.sink
            .append(format!("fetched {} into {}", repo_url, checkout.display()));

        // GATING - every gated service passes before any image is built
        self.transition(PipelineState::Gating);
        for service in &self.config.services {
            if service.test_command.is_none() {
                self.sink.append(format!(
                    "gate {}: no tests declared, skipping",
                    service.name
                ));
                continue;
            }
            let context = checkout.join(&service.build_context);
            let passed = self
                .runner
                .run_tests(service, &context)
                .map_err(|e| self.fail(e))?;
            if !passed {
                return self.roll_back(service, &checkout, last_stable.as_deref(), GateKind::Tests);
            }
            self.sink
                .append(format!("gate {}: tests passed", service.name));

            if let Some(gate_command) = &self.config.gates.quality_command {
                let passed = self
                    .runner
                    .run_quality_gate(service, &context, gate_command)
                    .map_err(|e| self.fail(e))?;
                if !passed {
                    return self.roll_back(
                        service,
                        &checkout,
                        last_stable.as_deref(),
                        GateKind::Quality,
                    );
                }
                self.sink
                    .append(format!("gate {}: quality gate passed", service.name));
            }
        }

        // BUILDING - registry order; partial artifacts are not cleaned up
        self.transition(PipelineState::Building);
        let artifact_dir = self.config.artifact_dir();
        std::fs::create_dir_all(&artifact_dir).map_err(|e| {
            self.fail(Error::internal_io(format!(
                "Failed to create artifact dir: {}",
                e
            )))
        })?;

        let mut artifacts = Vec::with_capacity(self.config.services.len());
        for service in &self.config.services {
            let context = checkout.join(&service.build_context);
            self.runner
                .build_image(service, &context)
                .map_err(|e| self.fail(e))?;
            let dest = artifact_dir.join(format!("{}.tar", service.name));
            let size = self
                .runner
                .export_artifact(service, &dest)
                .map_err(|e| self.fail(e))?;
            self.sink.append(format!(
                "built {}: exported {} ({} bytes)",
                service.name,
                dest.display(),
                size
            ));
            artifacts.push(BuiltArtifact {
                service: service.clone(),
                path: dest,
                size,
            });
        }

        // Remote phases share one session, closed on every exit path
        let mut session = self.connect().map_err(|e| self.fail(e))?;
        let result = self.deploy_services(session.as_mut(), &artifacts);
        session.close();
        self.sink.append("remote session closed");
        result.map_err(|e| self.fail(e))?;

        Ok(PipelineState::Succeeded)
    }

    fn deploy_services(
        &self,
        session: &mut dyn RemoteSession,
        artifacts: &[BuiltArtifact],
    ) -> Result<()> {
        for artifact in artifacts {
            let service = &artifact.service;

            // CLEANING_TARGET - removing an absent container is not an error
            self.transition(PipelineState::CleaningTarget);
            let clean_cmd = format!(
                "docker rm -f {} >/dev/null 2>&1 || true",
                shell::quote_arg(&service.container_ref)
            );
            let output = session.execute(&clean_cmd, &mut |_| {})?;
            if !output.success {
                return Err(Error::remote_command_failed(
                    &clean_cmd,
                    output.exit_code,
                    output.stderr.trim(),
                ));
            }
            self.sink.append(format!(
                "cleaned target container '{}'",
                service.container_ref
            ));

            // TRANSFERRING - stream the artifact into the remote load command
            self.transition(PipelineState::Transferring);
            let progress_sink = Arc::clone(&self.sink);
            let progress_name = service.name.clone();
            let mut next_pct = 10u64;
            let mut on_progress = move |sent: u64, total: u64| {
                let pct = if total == 0 {
                    100
                } else {
                    sent.saturating_mul(100) / total
                };
                while pct >= next_pct && next_pct <= 100 {
                    progress_sink.append(format!(
                        "transfer {}: {}% ({}/{} bytes)",
                        progress_name, next_pct, sent, total
                    ));
                    next_pct += 10;
                }
            };
            let sent = session
                .stream_file("docker load", &artifact.path, &mut on_progress)
                .map_err(|e| Error::transfer_stream_failed(&service.name, e.message.clone()))?;
            self.sink.append(format!(
                "transferred {}: {} of {} bytes",
                service.name, sent, artifact.size
            ));

            // STARTING
            self.transition(PipelineState::Starting);
            let start_cmd = start_command(service);
            let start_sink = Arc::clone(&self.sink);
            let output =
                session.execute(&start_cmd, &mut |line| start_sink.append(format!("remote: {}", line)))?;
            if !output.success {
                return Err(Error::remote_command_failed(
                    &start_cmd,
                    output.exit_code,
                    output.stderr.trim(),
                ));
            }
            self.sink.append(format!(
                "started '{}' on port {}",
                service.container_ref, service.published_port
            ));

            // Artifact served its purpose; deletion trouble is not fatal
            if let Err(e) = std::fs::remove_file(&artifact.path) {
                self.sink.append(format!(
                    "warning: failed to delete artifact {}: {}",
                    artifact.path.display(),
                    e
                ));
            } else {
                self.sink.append(format!(
                    "deleted local artifact {}",
                    artifact.path.display()
                ));
            }

            self.sink
                .append(format!("service {} deployed", service.name));
        }
        Ok(())
    }

    fn roll_back(
        &self,
        service: &ServiceDescriptor,
        checkout: &Path,
        last_stable: Option<&str>,
        kind: GateKind,
    ) -> Result<PipelineState> {
        self.sink.append(format!(
            "gate failed for '{}', rolling back",
            service.name
        ));
        log_status!("pipeline", "Gate failed for '{}', rolling back", service.name);

        let outcome = self.attempt_rollback(checkout, last_stable);
        self.sink
            .append(format!("rollback {}", outcome.as_str()));
        self.transition(PipelineState::RolledBack);

        let err = match kind {
            GateKind::Tests => Error::gate_tests_failed(&service.name),
            GateKind::Quality => Error::gate_quality_failed(&service.name),
        };
        self.sink
            .append(format!("run rolled back: {}", err.message));
        Err(err)
    }

    /// Rollback sub-machine. Sub-failures downgrade the outcome from
    /// `Done` to `Partial` and are recorded in the log, never raised.
    fn attempt_rollback(&self, checkout: &Path, last_stable: Option<&str>) -> RollbackOutcome {
        let mut partial = false;

        match last_stable {
            Some(rev) => match self.source.reset_hard(checkout, rev) {
                Ok(()) => self
                    .sink
                    .append(format!("working tree reset to {}", rev)),
                Err(e) => {
                    partial = true;
                    self.sink.append(format!(
                        "rollback: working tree reset failed: {}",
                        e.message
                    ));
                }
            },
            None => self.sink.append(
                "rollback: no stable revision recorded, skipping working tree reset",
            ),
        }

        match self.connect() {
            Ok(mut session) => {
                for service in &self.config.services {
                    let previous = previous_image_ref(&service.image_ref);
                    // A missing previous image is a no-op, not a failure
                    let cmd = format!(
                        "if docker image inspect {img} >/dev/null 2>&1; then \
                         docker rm -f {container} >/dev/null 2>&1 || true; \
                         docker run -d --name {container} -p {port} {img}; \
                         else echo {msg}; fi",
                        img = shell::quote_arg(&previous),
                        container = shell::quote_arg(&service.container_ref),
                        port = shell::quote_arg(&service.published_port.to_string()),
                        msg = shell::quote_arg(&format!(
                            "no previous image for {}",
                            service.name
                        )),
                    );
                    let sink = Arc::clone(&self.sink);
                    match session.execute(&cmd, &mut |line| sink.append(format!("remote: {}", line)))
                    {
                        Ok(output) if output.success => {}
                        Ok(output) => {
                            partial = true;
                            self.sink.append(format!(
                                "rollback: container rollback failed for '{}' (exit {})",
                                service.name, output.exit_code
                            ));
                        }
                        Err(e) => {
                            partial = true;
                            self.sink.append(format!(
                                "rollback: container rollback failed for '{}': {}",
                                service.name, e.message
                            ));
                        }
                    }
                }
                session.close();
                self.sink.append("remote session closed");
            }
            Err(e) => {
                partial = true;
                self.sink
                    .append(format!("rollback: remote rollback skipped: {}", e.message));
            }
        }

        if partial {
            RollbackOutcome::Partial
        } else {
            RollbackOutcome::Done
        }
    }
}

fn start_command(service: &ServiceDescriptor) -> String {
    format!(
        "docker run -d --name {} -p {} {}",
        shell::quote_arg(&service.container_ref),
        shell::quote_arg(&service.published_port.to_string()),
        shell::quote_arg(&service.image_ref),
    )
}

/// Replace the image tag with `previous`. A ':' after the last '/' is a
/// tag; any earlier ':' belongs to a registry port.
pub fn previous_image_ref(image_ref: &str) -> String {
    let tag_start = match image_ref.rfind('/') {
        Some(slash) => image_ref[slash..].find(':').map(|i| slash + i),
        None => image_ref.find(':'),
    };
    match tag_start {
        Some(idx) => format!("{}:previous", &image_ref[..idx]),
        None => format!("{}:previous", image_ref),
    }
}
