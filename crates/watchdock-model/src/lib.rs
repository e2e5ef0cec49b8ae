//! Shared vocabulary of watchdock: desired container specifications, the
//! engine-side snapshots the reconciler keeps, and the events exchanged
//! between the declarative store and the runtime reconciler.

mod domain;
pub use domain::*;

mod event;
pub use event::{DELETE_SENTINEL, Event, EventKind, Origin};

mod error;
pub use error::ValidationError;
