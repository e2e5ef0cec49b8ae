use async_trait::async_trait;
use tokio::sync::mpsc;
use watchdock_model::{
    ContainerId, ContainerName, EngineConfig, HostConfig, ImageRef, RuntimeContainerRef,
};

use crate::EngineError;

/// Placeholder tag the engine reports for dangling images.
pub const UNTAGGED: &str = "<none>:<none>";

/// One row of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    /// Engine names, usually with a leading `/`.
    pub names: Vec<String>,
    pub image: String,
    pub image_id: String,
    pub running: bool,
}

impl ContainerSummary {
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }
}

/// Result of inspecting one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: ContainerId,
    pub name: ContainerName,
    pub image: String,
    pub running: bool,
    pub config: EngineConfig,
    pub host_config: HostConfig,
    pub ip_address: Option<String>,
}

impl From<ContainerDetails> for RuntimeContainerRef {
    fn from(d: ContainerDetails) -> Self {
        let image = if d.config.image.is_empty() {
            d.image
        } else {
            d.config.image.clone()
        };
        RuntimeContainerRef {
            name: d.name.trim_start_matches('/').to_string(),
            id: Some(d.id),
            image,
            config: d.config,
            host_config: d.host_config,
            protect: false,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

impl ImageSummary {
    /// No human-assigned tag: nothing at all, or only the dangling placeholder.
    pub fn is_untagged(&self) -> bool {
        self.repo_tags.iter().all(|t| t == UNTAGGED)
    }
}

/// Container lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub id: ContainerId,
    pub name: Option<ContainerName>,
    pub status: String,
}

impl EngineEvent {
    pub fn new(id: impl Into<String>, name: Option<&str>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.map(|n| n.trim_start_matches('/').to_string()),
            status: status.into(),
        }
    }
}

pub type EngineEventRx = mpsc::Receiver<EngineEvent>;

/// Operations the reconciler needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    /// Returns [`EngineError::ImageMissing`] when the image is not present locally.
    async fn create_container(
        &self,
        name: &str,
        config: &EngineConfig,
        host: &HostConfig,
    ) -> Result<ContainerId, EngineError>;

    async fn start_container(&self, id: &str, host: &HostConfig) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    async fn remove_image(&self, id: &str) -> Result<(), EngineError>;

    /// Subscribe to lifecycle notifications. The receiver ends when the stream does.
    async fn events(&self) -> Result<EngineEventRx, EngineError>;
}
