//! Detached periodic pass: refresh images, converge every entry, prune dangling images.

use std::{collections::BTreeSet, sync::Arc};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use watchdock_model::{ImageRef, RuntimeContainerRef};

use crate::{ContainerEngine, PullGate, PullSlot, ReconcilerHandle, reconcile_one};

pub(crate) async fn run<E: ContainerEngine>(
    engine: Arc<E>,
    handle: ReconcilerHandle,
    snapshot: Vec<RuntimeContainerRef>,
    prune: bool,
) {
    debug!(entries = snapshot.len(), "sweep started");

    let pulled = pull_images(engine.as_ref(), &handle, &snapshot).await;
    let failed = reconcile_all(&engine, &handle, snapshot).await;

    if prune {
        if handle.pulls_in_flight().await == 0 {
            prune_untagged(engine.as_ref(), &handle).await;
        } else {
            debug!("pull in flight; prune skipped");
        }
    }

    debug!(pulled, failed, "sweep finished");
    handle.sweep_done();
}

/// Pull every distinct image referenced by `snapshot`, skipping ones already being pulled.
pub(crate) async fn pull_images<E, G>(
    engine: &E,
    gate: &G,
    snapshot: &[RuntimeContainerRef],
) -> usize
where
    E: ContainerEngine + ?Sized,
    G: PullGate + ?Sized,
{
    let mut images = BTreeSet::new();
    for r in snapshot.iter().filter(|r| !r.config.image.is_empty()) {
        match ImageRef::parse(&r.config.image) {
            Ok(image) => {
                images.insert(image);
            }
            Err(e) => warn!(image = %r.config.image, error = %e, "skipping unparsable image"),
        }
    }

    let mut pulled = 0;
    for image in images {
        let key = image.to_string();

        match gate.acquire(&key).await {
            PullSlot::Lead => {
                let res = engine.pull_image(&image).await;
                gate.release(&key, res.is_ok()).await;
                match res {
                    Ok(()) => pulled += 1,
                    Err(e) => warn!(image = %key, error = %e, "image refresh failed"),
                }
            }
            PullSlot::Wait(_) => debug!(image = %key, "already pulling"),
        }
    }
    pulled
}

async fn reconcile_all<E: ContainerEngine>(
    engine: &Arc<E>,
    handle: &ReconcilerHandle,
    snapshot: Vec<RuntimeContainerRef>,
) -> usize {
    let mut set = JoinSet::new();
    for entry in snapshot {
        let engine = Arc::clone(engine);
        let handle = handle.clone();
        set.spawn(async move {
            match reconcile_one(engine.as_ref(), &handle, &entry).await {
                Ok(out) => {
                    handle.record(&entry.name, &out);
                    true
                }
                Err(e) => {
                    warn!(name = %entry.name, error = %e, "sweep reconcile failed");
                    false
                }
            }
        });
    }

    let mut failed = 0;
    while let Some(res) = set.join_next().await {
        if !matches!(res, Ok(true)) {
            failed += 1;
        }
    }
    failed
}

/// Remove containers running dangling images, then the images themselves.
pub(crate) async fn prune_untagged<E>(engine: &E, handle: &ReconcilerHandle)
where
    E: ContainerEngine + ?Sized,
{
    let images = match engine.list_images().await {
        Ok(images) => images,
        Err(e) => {
            warn!(error = %e, "image listing failed; prune skipped");
            return;
        }
    };
    let untagged: BTreeSet<String> = images
        .into_iter()
        .filter(|i| i.is_untagged())
        .map(|i| i.id)
        .collect();
    if untagged.is_empty() {
        return;
    }

    match engine.list_containers(true).await {
        Ok(containers) => {
            for c in containers.iter().filter(|c| untagged.contains(&c.image_id)) {
                handle.protect(&c.id);
                match engine.remove_container(&c.id).await {
                    Ok(()) => info!(id = %c.id, image = %c.image_id, "pruned container"),
                    Err(e) if e.is_not_found() => debug!(id = %c.id, "container already gone"),
                    Err(e) => warn!(id = %c.id, error = %e, "container prune failed"),
                }
            }
        }
        Err(e) => warn!(error = %e, "container listing failed; pruning images only"),
    }

    for id in &untagged {
        match engine.remove_image(id).await {
            Ok(()) => info!(image = %id, "removed dangling image"),
            Err(e) => warn!(image = %id, error = %e, "image prune failed"),
        }
    }
}
