//! Local Consul server bring-up and leader wait.

use std::time::Duration;

use anyhow::{Context, bail};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use watchdock_core::{ContainerEngine, Ungated, create_with_pull};
use watchdock_model::{ContainerId, ContainerSpec, RuntimeContainerRef};
use watchdock_store::ConsulKv;

pub const CONSUL_NAME: &str = "consul";
pub const CONSUL_IMAGE: &str = "brimstone/consul";
pub const CONSUL_PORT: u16 = 8500;

const LEADER_POLL: Duration = Duration::from_secs(2);
const LEADER_RETRY: Duration = Duration::from_secs(1);
const LEADER_CEILING: Duration = Duration::from_secs(60);
const IP_ATTEMPTS: u32 = 30;

/// Server expecting `peers + 1` members and joining every peer.
pub fn consul_spec(peers: &[String]) -> ContainerSpec {
    let mut cmd = vec!["--bootstrap-expect".to_string(), (peers.len() + 1).to_string()];
    for p in peers {
        cmd.push("--join".to_string());
        cmd.push(p.clone());
    }
    ContainerSpec {
        cmd,
        ports: vec![format!("{CONSUL_PORT}:{CONSUL_PORT}")],
        ..ContainerSpec::new(CONSUL_NAME, CONSUL_IMAGE)
    }
}

/// Run until the local server reports a leader; returns its `ip:port`.
pub async fn run<E>(
    engine: &E,
    peers: &[String],
    shutdown: &CancellationToken,
) -> anyhow::Result<String>
where
    E: ContainerEngine + ?Sized,
{
    let target = RuntimeContainerRef::from_spec(&consul_spec(peers));

    loop {
        let id = ensure_running(engine, &target).await?;
        let ip = wait_for_ip(engine, &id, shutdown).await?;
        let address = format!("{ip}:{CONSUL_PORT}");
        info!(%id, %address, "consul server up; waiting for leader");

        if wait_for_leader(&address, shutdown).await? {
            return Ok(address);
        }

        warn!(%id, "no leader elected in time; recreating consul");
        if let Err(e) = engine.stop_container(&id).await {
            debug!(%id, error = %e, "stop failed");
        }
        engine
            .remove_container(&id)
            .await
            .with_context(|| format!("removing stale consul container {id}"))?;
    }
}

/// Start the consul container, replacing one that runs a different command.
pub async fn ensure_running<E>(
    engine: &E,
    target: &RuntimeContainerRef,
) -> anyhow::Result<ContainerId>
where
    E: ContainerEngine + ?Sized,
{
    let containers = engine.list_containers(true).await?;

    if let Some(found) = containers.iter().find(|c| c.has_name(&target.name)) {
        let details = engine.inspect_container(&found.id).await?;
        if details.config.cmd == target.config.cmd {
            if !details.running {
                engine
                    .start_container(&found.id, &target.host_config)
                    .await?;
            }
            return Ok(found.id.clone());
        }

        info!(id = %found.id, "consul runs with a different command; replacing");
        if details.running {
            engine.stop_container(&found.id).await?;
        }
        engine.remove_container(&found.id).await?;
    }

    let id = create_with_pull(engine, &Ungated, target).await?;
    engine.start_container(&id, &target.host_config).await?;
    Ok(id)
}

async fn wait_for_ip<E>(
    engine: &E,
    id: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<String>
where
    E: ContainerEngine + ?Sized,
{
    for _ in 0..IP_ATTEMPTS {
        if let Some(ip) = engine.inspect_container(id).await?.ip_address {
            return Ok(ip);
        }
        tokio::select! {
            _ = shutdown.cancelled() => bail!("shutdown while waiting for consul address"),
            _ = sleep(LEADER_RETRY) => {}
        }
    }
    bail!("consul container {id} never got an address")
}

/// `false` when no leader showed up within the ceiling.
async fn wait_for_leader(address: &str, shutdown: &CancellationToken) -> anyhow::Result<bool> {
    let client = ConsulKv::with_wait(address, LEADER_POLL)?;
    let deadline = Instant::now() + LEADER_CEILING;

    while Instant::now() < deadline {
        let pause = match client.leader().await {
            Ok(Some(leader)) => {
                info!(%leader, "consul leader elected");
                return Ok(true);
            }
            Ok(None) => LEADER_POLL,
            Err(e) => {
                debug!(error = %e, "leader query failed");
                LEADER_RETRY
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => bail!("shutdown while waiting for consul leader"),
            _ = sleep(pause) => {}
        }
    }
    Ok(false)
}
