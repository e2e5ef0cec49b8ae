mod args;
mod bootstrap;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watchdock_core::{Bus, Reconciler, ReconcilerConfig};
use watchdock_docker::DockerEngine;
use watchdock_observe::{LoggerConfig, logger_init};
use watchdock_store::{ConsulKv, DirConfig, DirStore, KvStore};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1) Logger
    logger_init(&LoggerConfig::from_flags(&args.log_level, &args.log_format)?)?;
    info!(version = env!("CARGO_PKG_VERSION"), "watchdock starting");

    // 2) Shutdown on Ctrl+C
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!(error = %e, "cannot listen for ctrl-c; shutting down"),
            }
            shutdown.cancel();
        });
    }

    // 3) Engine
    let engine = Arc::new(DockerEngine::connect(&args.docker)?);
    info!(address = %args.docker, "container engine configured");

    // 4) Sources
    let mut consul = args.consul.clone();
    if args.bootstrap {
        let address = bootstrap::run(engine.as_ref(), &args.join, &shutdown).await?;
        consul.push(address);
    }

    let reconciler = Reconciler::new(
        engine,
        ReconcilerConfig {
            sweep_interval: args.sweep_interval(),
            ..Default::default()
        },
    );
    let mut bus = Bus::new(reconciler);

    for dir in args.directories() {
        let store = DirStore::new(DirConfig::new(&dir).with_grace(args.grace()))?;
        info!(path = %dir.display(), "watching directory");
        bus.add_store(Box::new(store));
    }
    for address in &consul {
        let client = ConsulKv::new(address)?;
        info!(%address, "watching consul kv");
        bus.add_store(Box::new(KvStore::new(client, format!("consul:{address}"))));
    }

    // 5) Run until shutdown
    bus.run(shutdown).await?;
    info!("watchdock stopped");
    Ok(())
}
