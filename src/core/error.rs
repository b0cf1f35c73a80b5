use serde::Serialize;
use serde_json::{json, Value};

/// Stable machine-readable error codes, serialized as dotted strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthMutationDenied,
    PipelineBusy,

    ConfigInvalidJson,
    ConfigInvalidValue,

    SshServerInvalid,
    SshIdentityFileNotFound,
    SshConnectFailed,
    SshAuthFailed,

    RemoteCommandFailed,
    TransferStreamFailed,

    GateTestsFailed,
    GateQualityFailed,

    BuildImageFailed,
    BuildExportFailed,
    RunnerCommandTimeout,

    GitCommandFailed,

    InternalIoError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthMutationDenied => "auth.mutation_denied",
            ErrorCode::PipelineBusy => "pipeline.busy",

            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::SshServerInvalid => "ssh.server_invalid",
            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",
            ErrorCode::SshAuthFailed => "ssh.auth_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::TransferStreamFailed => "transfer.stream_failed",

            ErrorCode::GateTestsFailed => "gate.tests_failed",
            ErrorCode::GateQualityFailed => "gate.quality_failed",

            ErrorCode::BuildImageFailed => "build.image_failed",
            ErrorCode::BuildExportFailed => "build.export_failed",
            ErrorCode::RunnerCommandTimeout => "runner.command_timeout",

            ErrorCode::GitCommandFailed => "git.command_failed",

            ErrorCode::InternalIoError => "internal.io_error",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl Error {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }

    pub fn auth_mutation_denied(action: &str) -> Self {
        Self::with_details(
            ErrorCode::AuthMutationDenied,
            format!("Caller is not authorized to run '{}'", action),
            json!({ "action": action }),
        )
    }

    pub fn pipeline_busy() -> Self {
        Self::new(
            ErrorCode::PipelineBusy,
            "A pipeline run is already in flight",
        )
    }

    pub fn config_invalid_json(path: &str, err: impl std::fmt::Display) -> Self {
        Self::with_details(
            ErrorCode::ConfigInvalidJson,
            format!("Invalid config file {}: {}", path, err),
            json!({ "path": path }),
        )
    }

    pub fn config_invalid_value(key: &str, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        Self::with_details(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid config value '{}': {}", key, problem),
            json!({ "key": key, "problem": problem }),
        )
    }

    pub fn ssh_server_invalid(problem: impl Into<String>) -> Self {
        Self::new(ErrorCode::SshServerInvalid, problem)
    }

    pub fn ssh_identity_file_not_found(path: String) -> Self {
        Self::with_details(
            ErrorCode::SshIdentityFileNotFound,
            format!("SSH identity file not found: {}", path),
            json!({ "path": path }),
        )
    }

    pub fn ssh_connect_failed(host: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::with_details(
            ErrorCode::SshConnectFailed,
            format!("Failed to connect to {}: {}", host, detail),
            json!({ "host": host }),
        )
    }

    pub fn ssh_auth_failed(host: &str) -> Self {
        Self::with_details(
            ErrorCode::SshAuthFailed,
            format!("Authentication failed for {}", host),
            json!({ "host": host }),
        )
    }

    pub fn remote_command_failed(command: &str, exit_code: i32, stderr: &str) -> Self {
        Self::with_details(
            ErrorCode::RemoteCommandFailed,
            format!("Remote command failed (exit {}): {}", exit_code, command),
            json!({ "command": command, "exitCode": exit_code, "stderr": stderr }),
        )
    }

    pub fn transfer_stream_failed(service: &str, detail: impl Into<String>) -> Self {
        Self::with_details(
            ErrorCode::TransferStreamFailed,
            format!("Artifact transfer failed for '{}': {}", service, detail.into()),
            json!({ "service": service }),
        )
    }

    pub fn gate_tests_failed(service: &str) -> Self {
        Self::with_details(
            ErrorCode::GateTestsFailed,
            format!("Tests failed for service '{}'", service),
            json!({ "service": service, "terminalState": "rolled_back" }),
        )
    }

    pub fn gate_quality_failed(service: &str) -> Self {
        Self::with_details(
            ErrorCode::GateQualityFailed,
            format!("Quality gate failed for service '{}'", service),
            json!({ "service": service, "terminalState": "rolled_back" }),
        )
    }

    pub fn build_image_failed(service: &str, detail: impl Into<String>) -> Self {
        Self::with_details(
            ErrorCode::BuildImageFailed,
            format!("Image build failed for '{}': {}", service, detail.into()),
            json!({ "service": service }),
        )
    }

    pub fn build_export_failed(service: &str, detail: impl Into<String>) -> Self {
        Self::with_details(
            ErrorCode::BuildExportFailed,
            format!("Artifact export failed for '{}': {}", service, detail.into()),
            json!({ "service": service }),
        )
    }

    pub fn runner_command_timeout(context: &str, secs: u64) -> Self {
        Self::with_details(
            ErrorCode::RunnerCommandTimeout,
            format!("{} timed out after {}s", context, secs),
            json!({ "context": context, "timeoutSecs": secs }),
        )
    }

    pub fn git_command_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::GitCommandFailed, detail)
    }

    pub fn internal_io(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalIoError, detail)
    }

    /// Attach the terminal pipeline state a failed run ended in.
    pub fn with_terminal_state(mut self, state: &str) -> Self {
        match &mut self.details {
            Value::Object(map) => {
                map.insert("terminalState".to_string(), json!(state));
            }
            Value::Null => {
                self.details = json!({ "terminalState": state });
            }
            _ => {}
        }
        self
    }

    /// Terminal state recorded on a pipeline failure, if any.
    pub fn terminal_state(&self) -> Option<&str> {
        self.details.get("terminalState").and_then(Value::as_str)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal_io(err.to_string())
    }
}
