mod container_spec;
pub use container_spec::ContainerSpec;

mod engine_config;
pub use engine_config::{EngineConfig, HostConfig};

mod runtime_ref;
pub use runtime_ref::RuntimeContainerRef;

mod image_ref;
pub use image_ref::{ImagePullState, ImageRef};

mod serde_util;

/// Unique key of a container specification within a store.
pub type ContainerName = String;

/// Identifier assigned by the container engine on creation.
pub type ContainerId = String;
