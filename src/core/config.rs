use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::service::{self, ServiceDescriptor};

/// Target host definition: one reachable machine, one set of credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Server {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty()
    }

    /// Tilde-expand the identity file and verify it exists.
    pub fn resolved_identity_file(&self) -> Result<Option<String>> {
        match &self.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(expanded));
                }
                Ok(Some(expanded))
            }
            _ => Ok(None),
        }
    }
}

/// Default source location used when the trigger omits repo arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub url: String,
    pub name: String,
}

/// Optional quality gate run after tests pass for gated services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gates {
    #[serde(default)]
    pub quality_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub server: Server,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub gates: Gates,
    pub services: Vec<ServiceDescriptor>,
}

fn default_workspace() -> String {
    "~/.dockhand/workspace".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

// Build and test tooling can hang; minutes, not seconds.
fn default_command_timeout_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config_invalid_json(&path.display().to_string(), e)
        })?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::config_invalid_json(&path.display().to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.is_valid() {
            return Err(Error::config_invalid_value(
                "server",
                "host and user are required",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::config_invalid_value(
                "connectTimeoutSecs",
                "must be greater than zero",
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::config_invalid_value(
                "commandTimeoutSecs",
                "must be greater than zero",
            ));
        }
        service::validate_registry(&self.services)?;
        Ok(())
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.workspace).to_string())
    }

    /// Local working tree for the fetched repository.
    pub fn checkout_dir(&self, repo_name: &str) -> PathBuf {
        self.workspace_dir().join(repo_name)
    }

    /// Where exported image artifacts land before transfer.
    pub fn artifact_dir(&self) -> PathBuf {
        self.workspace_dir().join("artifacts")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
