//! Runtime side of the orchestrator: engine contract, reconciler actor and bus wiring.

mod error;
pub use error::{BusError, EngineError, ReconcileError};

pub mod engine;
pub use engine::{
    ContainerDetails, ContainerEngine, ContainerSummary, EngineEvent, EngineEventRx, ImageSummary,
};

pub mod converge;
pub use converge::{Admission, Outcome, create_with_pull, reconcile_one};

pub mod pull;
pub use pull::{PullGate, PullSlot, Ungated, pull_shared};

pub mod reconciler;
pub use reconciler::{Fanout, Reconciler, ReconcilerConfig, ReconcilerHandle};

pub mod bus;
pub use bus::Bus;

mod view;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
