use serde::{Deserialize, Serialize};

use super::serde_util::null_default;
use crate::{EngineConfig, HostConfig, RuntimeContainerRef, ValidationError};

/// Desired container specification.
///
/// One record per declarative entry; `name` uniquely identifies it within a store.
/// Field names are PascalCase on the wire, unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// `host:container[/proto]` or bare `container[/proto]`.
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// `host:container[:mode]` binds or bare container paths.
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "is_zero")]
    pub max_instances: u32,
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "is_false")]
    pub pty: bool,
    /// Placement tags.
    #[serde(
        rename = "Where",
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub placement: Vec<String>,

    /// Engine configuration snapshot carried by records the runtime produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<EngineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,

    /// Transient sweep protection; never persisted.
    #[serde(skip)]
    pub protect: bool,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl ContainerSpec {
    /// Minimal spec with a name and an image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Normalize the name (engines report `/name`) and check it.
    pub fn validated(mut self) -> Result<Self, ValidationError> {
        self.name = normalize_name(&self.name)?;
        Ok(self)
    }

    /// Engine configuration: the embedded snapshot if present, else derived from the fields.
    pub fn engine_config(&self) -> EngineConfig {
        if let Some(cfg) = &self.config {
            let mut cfg = cfg.clone();
            if cfg.image.is_empty() {
                cfg.image = self.image.clone();
            }
            return cfg;
        }
        EngineConfig {
            image: self.image.clone(),
            hostname: self.hostname.clone(),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            tty: self.pty,
            exposed_ports: self.ports.iter().map(|p| container_port(p).to_string()).collect(),
            volumes: self
                .volumes
                .iter()
                .filter(|v| !v.contains(':'))
                .cloned()
                .collect(),
        }
    }

    /// Host configuration: the embedded snapshot if present, else derived from the fields.
    pub fn host_config(&self) -> HostConfig {
        if let Some(host) = &self.host_config {
            return host.clone();
        }
        HostConfig {
            binds: self
                .volumes
                .iter()
                .filter(|v| v.contains(':'))
                .cloned()
                .collect(),
            port_bindings: self
                .ports
                .iter()
                .filter(|p| p.contains(':'))
                .cloned()
                .collect(),
            volumes_from: self.volumes_from.clone(),
        }
    }

    /// Record describing a container the runtime observed.
    pub fn from_runtime(r: &RuntimeContainerRef) -> Self {
        let image = if r.config.image.is_empty() {
            r.image.clone()
        } else {
            r.config.image.clone()
        };
        let mut volumes = r.host_config.binds.clone();
        volumes.extend(r.config.volumes.iter().cloned());

        Self {
            name: r.name.clone(),
            image,
            hostname: r.config.hostname.clone(),
            cmd: r.config.cmd.clone(),
            ports: r.host_config.port_bindings.clone(),
            volumes,
            volumes_from: r.host_config.volumes_from.clone(),
            env: r.config.env.clone(),
            pty: r.config.tty,
            config: Some(r.config.clone()),
            host_config: Some(r.host_config.clone()),
            protect: r.protect,
            ..Default::default()
        }
    }
}

/// Strip the engine's leading `/` and reject empty or nested names.
pub(crate) fn normalize_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim().trim_start_matches('/');
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.contains('/') {
        return Err(ValidationError::InvalidName(raw.to_string()));
    }
    Ok(name.to_string())
}

/// `"8080:80/tcp"` -> `"80/tcp"`, `"80"` -> `"80"`.
fn container_port(port: &str) -> &str {
    port.rsplit(':').next().unwrap_or(port)
}
