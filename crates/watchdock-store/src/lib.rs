//! Declarative desired-state backends.
//!
//! A [`StateStore`] turns its source into a stream of [`watchdock_model::Event`]s
//! and persists the events the runtime pushes back, without re-emitting its own writes.

mod store;
pub use store::{EventRx, EventTx, StateStore};

mod error;
pub use error::StoreError;

pub mod dir;
pub use dir::{DirConfig, DirStore};

pub mod kv;
pub use kv::{ConsulKv, KvClient, KvStore};
