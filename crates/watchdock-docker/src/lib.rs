//! [`watchdock_core::ContainerEngine`] over the Docker Engine API.

mod convert;

mod docker;
pub use docker::{DEFAULT_ADDRESS, DockerEngine};
