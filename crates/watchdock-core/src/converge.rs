//! Bring one desired container to the running state.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use watchdock_model::{ContainerId, EngineConfig, ImageRef, RuntimeContainerRef};

use crate::{ContainerEngine, EngineError, PullGate, Ungated, pull_shared};

/// What reconciling one entry did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already running; no mutating engine call was made.
    AlreadyRunning(ContainerId),
    /// An existing stopped container was started.
    Started(ContainerId),
    /// A new container was created and started.
    Created(ContainerId),
    /// The entry was removed or replaced before it could be started; nothing runs for it.
    Withdrawn,
}

impl Outcome {
    pub fn id(&self) -> Option<&str> {
        match self {
            Outcome::AlreadyRunning(id) | Outcome::Started(id) | Outcome::Created(id) => Some(id),
            Outcome::Withdrawn => None,
        }
    }

    /// Whether this reconcile brought a container up.
    pub fn started(&self) -> bool {
        matches!(self, Outcome::Started(_) | Outcome::Created(_))
    }
}

/// Checks a reconcile makes with the owner of the desired state before it mutates the engine.
#[async_trait]
pub trait Admission: PullGate {
    /// `false` once `target` was removed or superseded by a newer revision.
    async fn may_start(&self, target: &RuntimeContainerRef) -> bool;

    /// `id` is about to be removed by the runtime itself; its destroy is not a deletion.
    fn shield(&self, id: &str);
}

#[async_trait]
impl Admission for Ungated {
    async fn may_start(&self, _target: &RuntimeContainerRef) -> bool {
        true
    }

    fn shield(&self, _id: &str) {}
}

/// Match `target` by name against the engine and converge it.
///
/// A stopped container whose image or command no longer matches `target` is
/// removed and recreated.
#[instrument(level = "debug", skip_all, fields(name = %target.name))]
pub async fn reconcile_one<E, A>(
    engine: &E,
    gate: &A,
    target: &RuntimeContainerRef,
) -> Result<Outcome, EngineError>
where
    E: ContainerEngine + ?Sized,
    A: Admission + ?Sized,
{
    let containers = engine.list_containers(true).await?;

    if let Some(found) = containers.into_iter().find(|c| c.has_name(&target.name)) {
        if found.running {
            debug!(id = %found.id, "already running");
            return Ok(Outcome::AlreadyRunning(found.id));
        }

        let details = engine.inspect_container(&found.id).await?;
        if matches_target(&details.config, target) {
            if !gate.may_start(target).await {
                debug!(id = %found.id, "entry withdrawn; left stopped");
                return Ok(Outcome::Withdrawn);
            }
            engine
                .start_container(&found.id, &target.host_config)
                .await?;
            info!(id = %found.id, "started stopped container");
            return Ok(Outcome::Started(found.id));
        }

        info!(
            id = %found.id,
            have = %details.config.image,
            want = %target.config.image,
            "stopped container is out of date; replacing"
        );
        gate.shield(&found.id);
        engine.remove_container(&found.id).await?;
    }

    let id = create_with_pull(engine, gate, target).await?;
    if !gate.may_start(target).await {
        info!(%id, "entry withdrawn while creating; discarding container");
        engine.remove_container(&id).await?;
        return Ok(Outcome::Withdrawn);
    }
    engine.start_container(&id, &target.host_config).await?;
    info!(%id, image = %target.config.image, "created and started container");
    Ok(Outcome::Created(id))
}

/// Same image (tags normalized) and, when the target names one, the same command.
fn matches_target(have: &EngineConfig, target: &RuntimeContainerRef) -> bool {
    let want = &target.config;
    let same_image = match (ImageRef::parse(&have.image), ImageRef::parse(&want.image)) {
        (Ok(a), Ok(b)) => a == b,
        _ => have.image == want.image,
    };
    same_image && (want.cmd.is_empty() || have.cmd == want.cmd)
}

enum Phase {
    Create { pulled: bool },
    Pull,
}

/// `Create -> (ImageMissing) -> Pull -> Create`; a second miss is returned as is.
pub async fn create_with_pull<E, G>(
    engine: &E,
    gate: &G,
    target: &RuntimeContainerRef,
) -> Result<ContainerId, EngineError>
where
    E: ContainerEngine + ?Sized,
    G: PullGate + ?Sized,
{
    let mut phase = Phase::Create { pulled: false };
    loop {
        phase = match phase {
            Phase::Create { pulled } => {
                match engine
                    .create_container(&target.name, &target.config, &target.host_config)
                    .await
                {
                    Ok(id) => return Ok(id),
                    Err(EngineError::ImageMissing(_)) if !pulled => Phase::Pull,
                    Err(e) => return Err(e),
                }
            }
            Phase::Pull => {
                let image = ImageRef::parse(&target.config.image)
                    .map_err(|_| EngineError::InvalidImage(target.config.image.clone()))?;
                pull_shared(engine, gate, &image).await?;
                Phase::Create { pulled: true }
            }
        };
    }
}
