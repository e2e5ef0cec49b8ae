//! In-memory [`ContainerEngine`] for tests.

use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use watchdock_model::{ContainerId, EngineConfig, HostConfig, ImageRef};

use crate::{
    ContainerDetails, ContainerEngine, ContainerSummary, EngineError, EngineEvent, EngineEventRx,
    ImageSummary, engine::UNTAGGED,
};

/// Every mutating call the mock received, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    /// Container names passed to create, failed attempts included.
    pub create: Vec<String>,
    pub start: Vec<ContainerId>,
    pub stop: Vec<ContainerId>,
    pub kill: Vec<ContainerId>,
    pub remove: Vec<ContainerId>,
    /// `repo:tag` of every pull.
    pub pull: Vec<String>,
    pub remove_image: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: ContainerId,
    name: String,
    image: String,
    image_id: String,
    running: bool,
    config: EngineConfig,
    host_config: HostConfig,
    ip_address: Option<String>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<ContainerId, MockContainer>,
    images: Vec<ImageSummary>,
    next_id: u64,
    calls: Calls,
    pulls_fail: bool,
    list_fails: bool,
    subscriptions: usize,
}

impl MockState {
    fn image_id(&self, image: &str) -> Option<String> {
        if let Some(img) = self.images.iter().find(|i| i.id == image) {
            return Some(img.id.clone());
        }
        let wanted = ImageRef::parse(image).ok()?.to_string();
        self.images
            .iter()
            .find(|i| i.repo_tags.contains(&wanted))
            .map(|i| i.id.clone())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:04}", self.next_id)
    }
}

/// Engine double: containers and images live in memory, every mutating call is recorded.
///
/// Creating a container whose image is not present fails with
/// [`EngineError::ImageMissing`] until the image is pulled.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    subscriber: Mutex<Option<mpsc::Sender<EngineEvent>>>,
    pull_delay: Duration,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls take `delay` before completing.
    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: delay,
            ..Self::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn calls(&self) -> Calls {
        self.lock().calls.clone()
    }

    /// Register a tagged image; returns its id.
    pub fn add_image(&self, image: &str) -> String {
        let mut st = self.lock();
        let tag = ImageRef::parse(image)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| image.to_string());
        if let Some(id) = st.image_id(&tag) {
            return id;
        }
        let id = st.next_id("sha256:");
        st.images.push(ImageSummary {
            id: id.clone(),
            repo_tags: vec![tag],
        });
        id
    }

    /// Register a dangling image under `id`.
    pub fn add_untagged_image(&self, id: &str) {
        self.lock().images.push(ImageSummary {
            id: id.to_string(),
            repo_tags: vec![UNTAGGED.to_string()],
        });
    }

    /// Insert a container without recording a call; `image` may be a tag or an image id.
    pub fn add_container(&self, name: &str, image: &str, running: bool) -> ContainerId {
        let mut st = self.lock();
        let id = st.next_id("c");
        let image_id = st.image_id(image).unwrap_or_default();
        st.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                image_id,
                running,
                config: EngineConfig {
                    image: image.to_string(),
                    ..Default::default()
                },
                host_config: HostConfig::default(),
                ip_address: Some("172.17.0.2".into()),
            },
        );
        id
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .containers
            .values()
            .any(|c| c.name == name && c.running)
    }

    /// Image of the running container called `name`.
    pub fn running_image(&self, name: &str) -> Option<String> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name && c.running)
            .map(|c| c.image.clone())
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.lock().containers.values().any(|c| c.name == name)
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().image_id(image).is_some()
    }

    /// Pulls report success without making the image available.
    pub fn fail_pulls_silently(&self) {
        self.lock().pulls_fail = true;
    }

    /// Container listings fail with a transport error.
    pub fn fail_listing(&self) {
        self.lock().list_fails = true;
    }

    /// How many times [`ContainerEngine::events`] was called.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }

    /// End the current notification stream, as a lost engine connection would.
    pub fn drop_subscriber(&self) {
        self.subscriber
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    /// Deliver a lifecycle notification to the current subscriber.
    pub async fn emit(&self, event: EngineEvent) {
        let tx = self
            .subscriber
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn not_found(id: &str) -> EngineError {
        EngineError::NotFound(id.to_string())
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let st = self.lock();
        if st.list_fails {
            return Err(EngineError::Transport("connection refused".into()));
        }
        Ok(st
            .containers
            .values()
            .filter(|c| all || c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: c.image.clone(),
                image_id: c.image_id.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let st = self.lock();
        let c = st.containers.get(id).ok_or_else(|| Self::not_found(id))?;
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: format!("/{}", c.name),
            image: c.image_id.clone(),
            running: c.running,
            config: c.config.clone(),
            host_config: c.host_config.clone(),
            ip_address: c.ip_address.clone(),
        })
    }

    async fn create_container(
        &self,
        name: &str,
        config: &EngineConfig,
        host: &HostConfig,
    ) -> Result<ContainerId, EngineError> {
        let mut st = self.lock();
        st.calls.create.push(name.to_string());

        if st.containers.values().any(|c| c.name == name) {
            return Err(EngineError::Conflict(name.to_string()));
        }
        let Some(image_id) = st.image_id(&config.image) else {
            return Err(EngineError::ImageMissing(config.image.clone()));
        };
        let id = st.next_id("c");
        st.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: config.image.clone(),
                image_id,
                running: false,
                config: config.clone(),
                host_config: host.clone(),
                ip_address: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str, _host: &HostConfig) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.calls.start.push(id.to_string());
        let c = st.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        c.running = true;
        c.ip_address = Some("172.17.0.2".into());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.calls.stop.push(id.to_string());
        let c = st.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        c.running = false;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.calls.kill.push(id.to_string());
        let c = st.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if !c.running {
            return Err(EngineError::Conflict(format!("{id} is not running")));
        }
        c.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.calls.remove.push(id.to_string());
        st.containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), EngineError> {
        self.lock().calls.pull.push(image.to_string());
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        if self.lock().pulls_fail {
            return Ok(());
        }
        self.add_image(&image.to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        Ok(self.lock().images.clone())
    }

    async fn remove_image(&self, id: &str) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.calls.remove_image.push(id.to_string());
        let before = st.images.len();
        st.images.retain(|i| i.id != id);
        if st.images.len() == before {
            return Err(Self::not_found(id));
        }
        Ok(())
    }

    async fn events(&self) -> Result<EngineEventRx, EngineError> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().subscriptions += 1;
        *self.subscriber.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        Ok(rx)
    }
}
