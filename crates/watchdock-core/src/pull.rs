//! Per-image pull admission.

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use watchdock_model::ImageRef;

use crate::{ContainerEngine, EngineError};

/// Answer to a pull admission request.
#[derive(Debug)]
pub enum PullSlot {
    /// Caller must pull and then release the slot.
    Lead,
    /// Another pull of the same image is in flight; resolves with its result.
    Wait(oneshot::Receiver<bool>),
}

/// Single-flight gate keyed by image name.
#[async_trait]
pub trait PullGate: Send + Sync {
    async fn acquire(&self, image: &str) -> PullSlot;

    /// Finish a pull led by the caller and wake everyone parked on it.
    async fn release(&self, image: &str, ok: bool);
}

/// Gate that admits every caller; for one-off flows outside the reconciler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ungated;

#[async_trait]
impl PullGate for Ungated {
    async fn acquire(&self, _image: &str) -> PullSlot {
        PullSlot::Lead
    }

    async fn release(&self, _image: &str, _ok: bool) {}
}

/// Pull `image` through `gate`, sharing the result of an in-flight pull if there is one.
pub async fn pull_shared<E, G>(engine: &E, gate: &G, image: &ImageRef) -> Result<(), EngineError>
where
    E: ContainerEngine + ?Sized,
    G: PullGate + ?Sized,
{
    let key = image.to_string();
    match gate.acquire(&key).await {
        PullSlot::Lead => {
            info!(image = %key, "pulling image");
            let res = engine.pull_image(image).await;
            gate.release(&key, res.is_ok()).await;
            match &res {
                Ok(()) => info!(image = %key, "image pulled"),
                Err(e) => warn!(image = %key, error = %e, "image pull failed"),
            }
            res
        }
        PullSlot::Wait(done) => {
            debug!(image = %key, "waiting for in-flight pull");
            match done.await {
                Ok(true) => Ok(()),
                _ => Err(EngineError::PullFailed(key)),
            }
        }
    }
}
