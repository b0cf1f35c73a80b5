use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Host:container port pair, configured as `"8080:80"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl From<PortMapping> for String {
    fn from(mapping: PortMapping) -> Self {
        mapping.to_string()
    }
}

impl TryFrom<String> for PortMapping {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let (host, container) = value.split_once(':').ok_or_else(|| {
            Error::config_invalid_value(
                "publishedPort",
                format!("expected 'host:container', got '{}'", value),
            )
        })?;
        let parse = |part: &str| {
            part.trim().parse::<u16>().map_err(|_| {
                Error::config_invalid_value(
                    "publishedPort",
                    format!("'{}' is not a valid port number", part),
                )
            })
        };
        Ok(Self {
            host: parse(host)?,
            container: parse(container)?,
        })
    }
}

/// One deployable unit. Defined at startup from static configuration,
/// never mutated, read many times per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    /// Path to this unit's source, relative to the fetched working tree.
    pub build_context: String,
    pub image_ref: String,
    pub container_ref: String,
    pub published_port: PortMapping,
    /// Services without a test command skip the gate phase entirely.
    #[serde(default)]
    pub test_command: Option<String>,
}

/// Validate the ordered service registry: non-empty entries, unique names.
pub fn validate_registry(services: &[ServiceDescriptor]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for service in services {
        if service.name.is_empty() {
            return Err(Error::config_invalid_value(
                "services",
                "service name must not be empty",
            ));
        }
        if service.image_ref.is_empty() || service.container_ref.is_empty() {
            return Err(Error::config_invalid_value(
                "services",
                format!("service '{}' needs imageRef and containerRef", service.name),
            ));
        }
        if !seen.insert(service.name.as_str()) {
            return Err(Error::config_invalid_value(
                "services",
                format!("duplicate service name '{}'", service.name),
            ));
        }
    }
    Ok(())
}
