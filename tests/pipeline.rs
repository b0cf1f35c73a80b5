use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use dockhand::command::CommandOutput;
use dockhand::config::{AppConfig, Gates, Server};
use dockhand::error::{Error, Result};
use dockhand::git::SourceControl;
use dockhand::pipeline::{Capability, Orchestrator, PipelineAction, PipelineState};
use dockhand::runner::BuildRunner;
use dockhand::service::{PortMapping, ServiceDescriptor};
use dockhand::ssh::{RemoteSession, RemoteTransport};

/// Shared, ordered record of everything the collaborators were asked to do.
type EventLog = Arc<Mutex<Vec<String>>>;

fn push(events: &EventLog, event: String) {
    events.lock().unwrap().push(event);
}

struct FakeTransport {
    events: EventLog,
    opened: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    fail_connect: bool,
    fail_stream_containing: Option<String>,
}

impl RemoteTransport for FakeTransport {
    fn connect(&self, _server: &Server, _timeout: Duration) -> Result<Box<dyn RemoteSession>> {
        if self.fail_connect {
            return Err(Error::ssh_connect_failed("deploy.example.com", "connection refused"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        push(&self.events, "session:open".to_string());
        Ok(Box::new(FakeSession {
            events: Arc::clone(&self.events),
            close_calls: Arc::clone(&self.close_calls),
            fail_stream_containing: self.fail_stream_containing.clone(),
        }))
    }
}

struct FakeSession {
    events: EventLog,
    close_calls: Arc<AtomicUsize>,
    fail_stream_containing: Option<String>,
}

impl RemoteSession for FakeSession {
    fn execute(&mut self, command: &str, on_line: &mut dyn FnMut(&str)) -> Result<CommandOutput> {
        push(&self.events, format!("remote:{}", command));
        on_line("ok");
        Ok(CommandOutput {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            success: true,
            exit_code: 0,
        })
    }

    fn stream_file(
        &mut self,
        _command: &str,
        local_path: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        push(&self.events, format!("load:{}", name));
        if let Some(marker) = &self.fail_stream_containing {
            if name.contains(marker) {
                return Err(Error::internal_io("connection reset mid-stream"));
            }
        }
        let size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);
        progress(size, size);
        Ok(size)
    }

    fn close(&mut self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        push(&self.events, "session:close".to_string());
    }
}

#[derive(Default)]
struct FakeRunner {
    events: EventLog,
    fail_tests_for: Option<String>,
    fail_quality_for: Option<String>,
    fail_build_for: Option<String>,
    /// Signals that a gated test run has started (busy-rejection test).
    entered_tests: Mutex<Option<mpsc::Sender<()>>>,
    /// Blocks the test run until released (busy-rejection test).
    release_tests: Mutex<Option<mpsc::Receiver<()>>>,
}

impl BuildRunner for FakeRunner {
    fn run_tests(&self, service: &ServiceDescriptor, _build_context: &Path) -> Result<bool> {
        let entered = self.entered_tests.lock().unwrap().take();
        let release = self.release_tests.lock().unwrap().take();
        if let (Some(tx), Some(rx)) = (entered, release) {
            let _ = tx.send(());
            let _ = rx.recv();
        }
        push(&self.events, format!("tests:{}", service.name));
        Ok(self.fail_tests_for.as_deref() != Some(service.name.as_str()))
    }

    fn run_quality_gate(
        &self,
        service: &ServiceDescriptor,
        _build_context: &Path,
        _gate_command: &str,
    ) -> Result<bool> {
        push(&self.events, format!("quality:{}", service.name));
        Ok(self.fail_quality_for.as_deref() != Some(service.name.as_str()))
    }

    fn build_image(&self, service: &ServiceDescriptor, _build_context: &Path) -> Result<()> {
        if self.fail_build_for.as_deref() == Some(service.name.as_str()) {
            return Err(Error::build_image_failed(&service.name, "base image pull failed"));
        }
        push(&self.events, format!("build:{}", service.name));
        Ok(())
    }

    fn export_artifact(&self, service: &ServiceDescriptor, dest: &Path) -> Result<u64> {
        std::fs::write(dest, vec![0u8; 1024])?;
        push(&self.events, format!("export:{}", service.name));
        Ok(1024)
    }
}

struct FakeGit {
    revision: Mutex<String>,
    resets: Arc<Mutex<Vec<String>>>,
}

impl FakeGit {
    fn new() -> Self {
        Self {
            revision: Mutex::new("rev-stable".to_string()),
            resets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn current(&self) -> String {
        self.revision.lock().unwrap().clone()
    }
}

impl SourceControl for FakeGit {
    fn current_revision(&self, _dir: &Path) -> Option<String> {
        Some(self.current())
    }

    fn sync(&self, _repo_url: &str, _dir: &Path) -> Result<()> {
        *self.revision.lock().unwrap() = "rev-new".to_string();
        Ok(())
    }

    fn reset_hard(&self, _dir: &Path, revision: &str) -> Result<()> {
        *self.revision.lock().unwrap() = revision.to_string();
        self.resets.lock().unwrap().push(revision.to_string());
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    events: EventLog,
    opened: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    git: Arc<FakeGit>,
    workspace: tempfile::TempDir,
}

struct HarnessOptions {
    fail_connect: bool,
    fail_stream_containing: Option<String>,
    fail_tests_for: Option<String>,
    fail_quality_for: Option<String>,
    fail_build_for: Option<String>,
    quality_command: Option<String>,
    blocking_tests: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            fail_connect: false,
            fail_stream_containing: None,
            fail_tests_for: None,
            fail_quality_for: None,
            fail_build_for: None,
            quality_command: None,
            blocking_tests: None,
        }
    }
}

fn service(name: &str, host_port: u16, test_command: Option<&str>) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        build_context: name.to_string(),
        image_ref: format!("acme/{}:latest", name),
        container_ref: format!("acme-{}", name),
        published_port: PortMapping {
            host: host_port,
            container: 80,
        },
        test_command: test_command.map(String::from),
    }
}

fn harness(options: HarnessOptions) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let config = AppConfig {
        server: Server {
            host: "deploy.example.com".to_string(),
            user: "ops".to_string(),
            port: 22,
            identity_file: None,
        },
        repository: None,
        workspace: workspace.path().to_string_lossy().to_string(),
        connect_timeout_secs: 5,
        command_timeout_secs: 60,
        gates: Gates {
            quality_command: options.quality_command.clone(),
        },
        services: vec![
            service("frontend", 8080, None),
            service("backend", 9000, Some("npm test")),
        ],
    };

    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let opened = Arc::new(AtomicUsize::new(0));
    let close_calls = Arc::new(AtomicUsize::new(0));

    let transport = Arc::new(FakeTransport {
        events: Arc::clone(&events),
        opened: Arc::clone(&opened),
        close_calls: Arc::clone(&close_calls),
        fail_connect: options.fail_connect,
        fail_stream_containing: options.fail_stream_containing,
    });

    let runner = Arc::new(FakeRunner {
        events: Arc::clone(&events),
        fail_tests_for: options.fail_tests_for,
        fail_quality_for: options.fail_quality_for,
        fail_build_for: options.fail_build_for,
        entered_tests: Mutex::new(options.blocking_tests.as_ref().map(|(tx, _)| tx.clone())),
        release_tests: Mutex::new(options.blocking_tests.map(|(_, rx)| rx)),
    });

    let git = Arc::new(FakeGit::new());

    let orchestrator = Arc::new(Orchestrator::with_collaborators(
        config,
        transport,
        runner,
        Arc::clone(&git) as Arc<dyn SourceControl>,
    ));

    Harness {
        orchestrator,
        events,
        opened,
        close_calls,
        git,
        workspace,
    }
}

fn mutate() -> Capability {
    Capability { can_mutate: true }
}

fn read_only() -> Capability {
    Capability { can_mutate: false }
}

fn events_of(harness: &Harness) -> Vec<String> {
    harness.events.lock().unwrap().clone()
}

fn index_of(events: &[String], needle: &str) -> usize {
    events
        .iter()
        .position(|e| e.contains(needle))
        .unwrap_or_else(|| panic!("event '{}' not found in {:?}", needle, events))
}

#[test]
fn check_status_opens_one_session_and_runs_one_command() {
    let h = harness(HarnessOptions::default());
    let report = h
        .orchestrator
        .invoke(PipelineAction::CheckStatus, "", "", &read_only())
        .unwrap();

    assert_eq!(report.state, PipelineState::Succeeded);
    assert!(report.success);
    assert_eq!(h.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.close_calls.load(Ordering::SeqCst), 1);

    let events = events_of(&h);
    let remote: Vec<&String> = events.iter().filter(|e| e.starts_with("remote:")).collect();
    assert_eq!(remote.len(), 1);
    assert!(remote[0].contains("docker ps"));

    // Read-only action never touches the rollback point
    assert_eq!(h.orchestrator.last_stable_revision(), None);
}

#[test]
fn mutation_requires_capability_and_opens_no_session() {
    let h = harness(HarnessOptions::default());
    let err = h
        .orchestrator
        .invoke(PipelineAction::FullDeploy, "git@example.com:acme/app.git", "app", &read_only())
        .unwrap_err();

    assert_eq!(err.code.as_str(), "auth.mutation_denied");
    assert_eq!(h.opened.load(Ordering::SeqCst), 0);
    // Rejected before any state transition: the previous buffer is untouched
    assert!(h.orchestrator.read_logs().is_empty());

    let err = h
        .orchestrator
        .invoke(PipelineAction::CleanTarget, "", "", &read_only())
        .unwrap_err();
    assert_eq!(err.code.as_str(), "auth.mutation_denied");
}

#[test]
fn second_invoke_while_running_is_rejected_busy() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let h = harness(HarnessOptions {
        blocking_tests: Some((entered_tx, release_rx)),
        ..HarnessOptions::default()
    });

    let orchestrator = Arc::clone(&h.orchestrator);
    let first = std::thread::spawn(move || {
        orchestrator.invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
    });

    // Wait until the first run is inside the gating phase
    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first run never reached the gate");

    let err = h
        .orchestrator
        .invoke(PipelineAction::CheckStatus, "", "", &read_only())
        .unwrap_err();
    assert_eq!(err.code.as_str(), "pipeline.busy");

    release_tx.send(()).unwrap();
    let report = first.join().unwrap().unwrap();
    assert_eq!(report.state, PipelineState::Succeeded);
}

#[test]
fn gate_failure_rolls_back_and_starts_nothing() {
    let h = harness(HarnessOptions {
        fail_tests_for: Some("backend".to_string()),
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
        .unwrap_err();

    assert_eq!(err.code.as_str(), "gate.tests_failed");
    assert_eq!(err.terminal_state(), Some("rolled_back"));

    // Working tree round-trips to the revision captured before fetch
    assert_eq!(h.git.current(), "rev-stable");
    assert_eq!(h.git.resets.lock().unwrap().as_slice(), ["rev-stable"]);
    assert_eq!(
        h.orchestrator.last_stable_revision().as_deref(),
        Some("rev-stable")
    );

    let events = events_of(&h);
    // Gate failed before the build phase: no images, no container starts.
    // The only place a start command may appear is inside rollback's
    // previous-image guard.
    assert!(events.iter().all(|e| !e.starts_with("build:")));
    assert!(events.iter().all(|e| !e.starts_with("load:")));
    for start in events.iter().filter(|e| e.contains("docker run -d --name")) {
        assert!(
            start.starts_with("remote:if docker image inspect"),
            "unguarded container start issued: {}",
            start
        );
    }

    // Best-effort remote rollback session was closed
    assert_eq!(
        h.opened.load(Ordering::SeqCst),
        h.close_calls.load(Ordering::SeqCst)
    );

    let logs = h.orchestrator.read_logs().join("\n");
    assert!(logs.contains("rolling back"));
    assert!(logs.contains("rollback done"));
}

#[test]
fn quality_gate_failure_rolls_back() {
    let h = harness(HarnessOptions {
        quality_command: Some("npm run lint".to_string()),
        fail_quality_for: Some("backend".to_string()),
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
        .unwrap_err();

    assert_eq!(err.code.as_str(), "gate.quality_failed");
    assert_eq!(err.terminal_state(), Some("rolled_back"));

    // Tests passed first, then the quality gate tripped
    let events = events_of(&h);
    assert!(events.iter().any(|e| e == "tests:backend"));
    assert!(events.iter().any(|e| e == "quality:backend"));
    assert!(events.iter().all(|e| !e.starts_with("build:")));

    // Same rollback path as a test failure
    assert_eq!(h.git.current(), "rev-stable");
    assert_eq!(h.git.resets.lock().unwrap().as_slice(), ["rev-stable"]);
}

#[test]
fn build_failure_fails_run_and_keeps_partial_artifacts() {
    let h = harness(HarnessOptions {
        fail_build_for: Some("backend".to_string()),
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
        .unwrap_err();

    assert_eq!(err.code.as_str(), "build.image_failed");
    assert_eq!(err.terminal_state(), Some("failed"));

    // Host untouched: the run died before any remote phase, no rollback
    assert_eq!(h.opened.load(Ordering::SeqCst), 0);
    assert!(h.git.resets.lock().unwrap().is_empty());
    assert_eq!(h.git.current(), "rev-new");

    // The earlier service's exported artifact is left for the operator
    let artifact_dir = h.workspace.path().join("artifacts");
    assert!(artifact_dir.join("frontend.tar").exists());

    let logs = h.orchestrator.read_logs().join("\n");
    assert!(logs.contains("run failed [build.image_failed]"));
}

#[test]
fn full_deploy_runs_phases_in_registry_order() {
    let h = harness(HarnessOptions::default());
    let report = h
        .orchestrator
        .invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
        .unwrap();
    assert_eq!(report.state, PipelineState::Succeeded);

    let events = events_of(&h);

    // All local gate+build work precedes any remote activity
    let session_open = index_of(&events, "session:open");
    assert!(index_of(&events, "tests:backend") < session_open);
    assert!(index_of(&events, "build:frontend") < session_open);
    assert!(index_of(&events, "export:backend") < session_open);

    // Builds follow registry order
    assert!(index_of(&events, "build:frontend") < index_of(&events, "build:backend"));

    // Per service: cleanup, then transfer, then start; frontend fully
    // deployed before backend's remote phase begins
    let f_clean = index_of(&events, "remote:docker rm -f acme-frontend");
    let f_load = index_of(&events, "load:frontend.tar");
    let f_start = index_of(&events, "remote:docker run -d --name acme-frontend");
    let b_clean = index_of(&events, "remote:docker rm -f acme-backend");
    let b_load = index_of(&events, "load:backend.tar");
    let b_start = index_of(&events, "remote:docker run -d --name acme-backend");
    assert!(f_clean < f_load && f_load < f_start);
    assert!(f_start < b_clean);
    assert!(b_clean < b_load && b_load < b_start);

    // One session for the whole remote phase, closed exactly once
    assert_eq!(h.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.close_calls.load(Ordering::SeqCst), 1);

    // Artifacts were deleted after their containers started
    let artifact_dir = h.workspace.path().join("artifacts");
    assert!(!artifact_dir.join("frontend.tar").exists());
    assert!(!artifact_dir.join("backend.tar").exists());
}

#[test]
fn transfer_failure_leaves_earlier_service_live_without_rollback() {
    let h = harness(HarnessOptions {
        fail_stream_containing: Some("backend".to_string()),
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .invoke(
            PipelineAction::FullDeploy,
            "git@example.com:acme/app.git",
            "app",
            &mutate(),
        )
        .unwrap_err();

    assert_eq!(err.code.as_str(), "transfer.stream_failed");
    assert_eq!(err.terminal_state(), Some("failed"));

    let events = events_of(&h);
    // Frontend made it all the way; backend failed mid-transfer
    assert!(events.iter().any(|e| e.contains("remote:docker run -d --name acme-frontend")));
    assert!(events.iter().any(|e| e == "load:backend.tar"));
    assert!(events.iter().all(|e| !e.contains("remote:docker run -d --name acme-backend")));

    // No rollback on transfer failure; host is left as-is for inspection
    assert!(h.git.resets.lock().unwrap().is_empty());
    assert_eq!(h.git.current(), "rev-new");

    // Session still closed exactly once on the failure path
    assert_eq!(h.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.close_calls.load(Ordering::SeqCst), 1);

    let logs = h.orchestrator.read_logs().join("\n");
    assert!(logs.contains("service frontend deployed"));
    assert!(logs.contains("transfer.stream_failed"));

    // Failed service's artifact is kept for the operator
    let artifact_dir = h.workspace.path().join("artifacts");
    assert!(!artifact_dir.join("frontend.tar").exists());
    assert!(artifact_dir.join("backend.tar").exists());
}

#[test]
fn connect_failure_fails_the_run_before_any_mutation() {
    let h = harness(HarnessOptions {
        fail_connect: true,
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .invoke(PipelineAction::CheckStatus, "", "", &read_only())
        .unwrap_err();

    assert_eq!(err.code.as_str(), "ssh.connect_failed");
    assert_eq!(err.terminal_state(), Some("failed"));
    assert_eq!(h.opened.load(Ordering::SeqCst), 0);
    assert_eq!(h.close_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn logs_reset_between_runs() {
    let h = harness(HarnessOptions::default());
    h.orchestrator
        .invoke(PipelineAction::CheckStatus, "", "", &read_only())
        .unwrap();
    let first_logs = h.orchestrator.read_logs();
    assert!(!first_logs.is_empty());

    h.orchestrator
        .invoke(PipelineAction::CleanTarget, "", "", &mutate())
        .unwrap();
    let second_logs = h.orchestrator.read_logs().join("\n");
    assert!(second_logs.contains("docker system prune"));
    assert!(!second_logs.contains("docker ps"));
}
