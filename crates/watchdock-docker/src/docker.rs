use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as DockerError,
    image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions},
    system::EventsOptions,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use watchdock_core::{
    ContainerDetails, ContainerEngine, ContainerSummary, EngineError, EngineEvent, EngineEventRx,
    ImageSummary,
};
use watchdock_model::{ContainerId, EngineConfig, HostConfig, ImageRef};

use crate::convert::{self, engine_error};

pub const DEFAULT_ADDRESS: &str = "unix:///var/run/docker.sock";

/// Seconds before any single API request gives up; pulls are the long pole.
const REQUEST_TIMEOUT: u64 = 600;
const EVENT_BUFFER: usize = 256;
const STOP_GRACE_SECS: i64 = 10;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to `unix://<path>`, `tcp://host:port` or `http://host:port`.
    pub fn connect(address: &str) -> Result<Self, EngineError> {
        let docker = if let Some(path) = address.strip_prefix("unix://") {
            Docker::connect_with_unix(path, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        } else if address.starts_with('/') {
            Docker::connect_with_unix(address, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        } else {
            let url = match address.strip_prefix("tcp://") {
                Some(rest) => format!("http://{rest}"),
                None if address.starts_with("http://") => address.to_string(),
                None => format!("http://{address}"),
            };
            Docker::connect_with_http(&url, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        }
        .map_err(engine_error)?;

        debug!(%address, "docker client ready");
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(engine_error)?;
        Ok(())
    }
}

fn is_missing_image(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let opts = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let rows = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(engine_error)?;

        Ok(rows
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                image_id: c.image_id.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let resp = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(engine_error)?;
        Ok(convert::details(resp))
    }

    async fn create_container(
        &self,
        name: &str,
        config: &EngineConfig,
        host: &HostConfig,
    ) -> Result<ContainerId, EngineError> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        match self
            .docker
            .create_container(Some(opts), convert::create_config(config, host))
            .await
        {
            Ok(resp) => {
                for w in &resp.warnings {
                    warn!(%name, warning = %w, "engine warning on create");
                }
                Ok(resp.id)
            }
            Err(e) if is_missing_image(&e) => Err(EngineError::ImageMissing(config.image.clone())),
            Err(e) => Err(engine_error(e)),
        }
    }

    async fn start_container(&self, id: &str, _host: &HostConfig) -> Result<(), EngineError> {
        // Host configuration is applied at create time on current API versions.
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_error)
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(engine_error)
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(engine_error)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(opts))
            .await
            .map_err(engine_error)
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError> {
        let opts = CreateImageOptions {
            from_image: image.repository.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        let mut progress = std::pin::pin!(self.docker.create_image(Some(opts), None, None));
        while let Some(step) = progress.next().await {
            let info = step.map_err(engine_error)?;
            if let Some(err) = info.error {
                return Err(EngineError::Api {
                    status: 500,
                    message: err,
                });
            }
            if let Some(status) = info.status {
                trace!(image = %image, %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let rows = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await
            .map_err(engine_error)?;

        Ok(rows
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags,
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        let opts = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(id, Some(opts), None)
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn events(&self) -> Result<EngineEventRx, EngineError> {
        self.ping().await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            let opts = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = std::pin::pin!(docker.events(Some(opts)));
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "engine event stream error");
                        break;
                    }
                };
                let Some(actor) = msg.actor else { continue };
                let Some(id) = actor.id else { continue };
                let name = actor
                    .attributes
                    .as_ref()
                    .and_then(|a| a.get("name"))
                    .map(String::as_str);
                let status = msg.action.unwrap_or_default();

                if tx.send(EngineEvent::new(id, name, status)).await.is_err() {
                    debug!("engine event receiver dropped");
                    return;
                }
            }
            info!("engine event stream closed");
        });

        Ok(rx)
    }
}
