use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use watchdock_model::Event;

use crate::StoreError;

pub type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

/// Capability shared by every declarative backend.
///
/// The bus only talks to stores through this trait.
#[async_trait]
pub trait StateStore: Send {
    /// Short label for logs (`dir:/tmp/containers`, `consul:10.0.0.2:8500`).
    fn name(&self) -> &str;

    /// Full scan of the source: one Upsert per valid entry.
    ///
    /// Returns the number of emitted events. Invalid entries are logged and skipped.
    async fn start(&mut self, outbound: &EventTx) -> Result<usize, StoreError>;

    /// Watch the source and persist inbound events until `shutdown` fires
    /// or the inbound channel closes.
    async fn sync(
        &mut self,
        inbound: EventRx,
        outbound: EventTx,
        shutdown: CancellationToken,
    ) -> Result<(), StoreError>;
}
