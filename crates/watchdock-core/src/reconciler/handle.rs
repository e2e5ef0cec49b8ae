use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use watchdock_model::{ContainerId, ContainerName, RuntimeContainerRef};

use crate::{Admission, EngineEventRx, Outcome, PullGate, PullSlot};

/// Messages the actor loop serializes with its other inputs.
pub(crate) enum Command {
    Snapshot(oneshot::Sender<Vec<RuntimeContainerRef>>),
    AcquirePull {
        image: String,
        reply: oneshot::Sender<PullSlot>,
    },
    ReleasePull {
        image: String,
        ok: bool,
    },
    PullsInFlight(oneshot::Sender<usize>),
    /// Is `name` still desired at `revision`?
    MayStart {
        name: ContainerName,
        revision: u64,
        reply: oneshot::Sender<bool>,
    },
    /// Inspected container the engine started on its own.
    Register(RuntimeContainerRef),
    RecordId {
        name: ContainerName,
        id: ContainerId,
        started: bool,
    },
    Protect(ContainerId),
    /// Replacement engine notification stream.
    Subscribed(EngineEventRx),
    SweepDone,
}

/// Cloneable access to a running [`crate::Reconciler`].
///
/// Calls made after the actor stopped are no-ops; queries return empty answers.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReconcilerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Copy of every tracked entry.
    pub async fn snapshot(&self) -> Vec<RuntimeContainerRef> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn pulls_in_flight(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::PullsInFlight(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Mark the entry tracking `id` so its destruction is not reported.
    pub fn protect(&self, id: &str) {
        let _ = self.tx.send(Command::Protect(id.to_string()));
    }

    /// Report what a reconcile of `name` did.
    pub(crate) fn record(&self, name: &str, outcome: &Outcome) {
        if let Some(id) = outcome.id() {
            let _ = self.tx.send(Command::RecordId {
                name: name.to_string(),
                id: id.to_string(),
                started: outcome.started(),
            });
        }
    }

    pub(crate) fn register(&self, entry: RuntimeContainerRef) {
        let _ = self.tx.send(Command::Register(entry));
    }

    pub(crate) fn subscribed(&self, events: EngineEventRx) {
        let _ = self.tx.send(Command::Subscribed(events));
    }

    pub(crate) fn sweep_done(&self) {
        let _ = self.tx.send(Command::SweepDone);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl PullGate for ReconcilerHandle {
    async fn acquire(&self, image: &str) -> PullSlot {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::AcquirePull {
            image: image.to_string(),
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return PullSlot::Lead;
        }
        rx.await.unwrap_or(PullSlot::Lead)
    }

    async fn release(&self, image: &str, ok: bool) {
        let _ = self.tx.send(Command::ReleasePull {
            image: image.to_string(),
            ok,
        });
    }
}

#[async_trait]
impl Admission for ReconcilerHandle {
    /// A stopped actor admits nothing.
    async fn may_start(&self, target: &RuntimeContainerRef) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::MayStart {
            name: target.name.clone(),
            revision: target.revision,
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    fn shield(&self, id: &str) {
        self.protect(id);
    }
}
