use crate::{ContainerId, ContainerName, ContainerSpec, EngineConfig, HostConfig};

/// What the reconciler knows about one managed container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContainerRef {
    pub name: ContainerName,
    /// Set only once the engine has created (or reported) the container.
    pub id: Option<ContainerId>,
    pub image: String,
    pub config: EngineConfig,
    pub host_config: HostConfig,
    /// Set by a sweep (or before the runtime removes the container itself); a
    /// destroy observed while set is not reported back to the stores.
    pub protect: bool,
    /// Desired-state revision this entry was registered under; 0 for containers
    /// the engine reported on its own.
    pub revision: u64,
}

impl RuntimeContainerRef {
    /// Desired entry built from a specification; no engine ID yet.
    pub fn from_spec(spec: &ContainerSpec) -> Self {
        let config = spec.engine_config();
        Self {
            name: spec.name.clone(),
            id: None,
            image: config.image.clone(),
            config,
            host_config: spec.host_config(),
            protect: false,
            revision: 0,
        }
    }

    /// Overwrite configuration from a newer view of the same container.
    ///
    /// An engine ID is kept unless the update carries one. Protection and
    /// revision belong to the reconciler and are left alone.
    pub fn update_from(&mut self, newer: RuntimeContainerRef) {
        if newer.id.is_some() {
            self.id = newer.id;
        }
        self.image = newer.image;
        self.config = newer.config;
        self.host_config = newer.host_config;
    }
}
