use std::{path::PathBuf, time::Duration};

use clap::Parser;
use watchdock_docker::DEFAULT_ADDRESS;

pub const DEFAULT_DIR: &str = "/tmp/containers";

#[derive(Parser, Debug)]
#[command(name = "watchdock")]
#[command(about = "Keep a container engine in line with a declarative set of container specs")]
#[command(version)]
pub struct Args {
    /// Container engine endpoint (unix://, tcp:// or http://).
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub docker: String,

    /// Directory of `<name>.json` specs; repeatable.
    #[arg(long = "dir", value_name = "PATH")]
    pub dirs: Vec<PathBuf>,

    /// Consul agent address to use as a spec source; repeatable.
    #[arg(long = "consul", value_name = "ADDR")]
    pub consul: Vec<String>,

    /// Peer to join when bootstrapping the local Consul server; repeatable.
    #[arg(long = "join", value_name = "ADDR")]
    pub join: Vec<String>,

    /// Run a local Consul server, wait for a leader and use it as a spec source.
    #[arg(long)]
    pub bootstrap: bool,

    /// Seconds between reconciliation sweeps.
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    pub sweep_interval: u64,

    /// Window in which a change to a file we just wrote counts as our own echo.
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    pub grace_ms: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// text, json or journald.
    #[arg(long, default_value = "text")]
    pub log_format: String,
}

impl Args {
    /// Directories to watch; the default one when no source was named at all.
    pub fn directories(&self) -> Vec<PathBuf> {
        if self.dirs.is_empty() && self.consul.is_empty() {
            return vec![PathBuf::from(DEFAULT_DIR)];
        }
        self.dirs.clone()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}
