use std::collections::HashMap;

use bollard::{
    container::Config,
    errors::Error as DockerError,
    models::{self, ContainerInspectResponse, PortBinding, PortMap},
};
use watchdock_core::{ContainerDetails, EngineError};
use watchdock_model::{EngineConfig, HostConfig};

const DEFAULT_PROTO: &str = "tcp";

pub(crate) fn engine_error(e: DockerError) -> EngineError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Transport(other.to_string()),
    }
}

/// `"80"` -> `"80/tcp"`; an explicit protocol is kept.
fn port_key(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/{DEFAULT_PROTO}")
    }
}

/// `[ip:]host:container[/proto]` -> (`container/proto`, binding).
fn parse_binding(spec: &str) -> Option<(String, PortBinding)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (ip, host, container) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [ip, host, container] => (Some(*ip), *host, *container),
        _ => return None,
    };
    if container.is_empty() {
        return None;
    }
    Some((
        port_key(container),
        PortBinding {
            host_ip: ip.filter(|s| !s.is_empty()).map(str::to_string),
            host_port: Some(host.to_string()).filter(|s| !s.is_empty()),
        },
    ))
}

fn key_set<'a>(keys: impl Iterator<Item = &'a str>) -> HashMap<String, HashMap<(), ()>> {
    keys.map(|k| (k.to_string(), HashMap::new())).collect()
}

pub(crate) fn port_map(host: &HostConfig) -> PortMap {
    let mut map: PortMap = HashMap::new();
    for (key, binding) in host.port_bindings.iter().filter_map(|p| parse_binding(p)) {
        if let Some(bindings) = map.entry(key).or_insert_with(|| Some(Vec::new())) {
            bindings.push(binding);
        }
    }
    map
}

pub(crate) fn host_config(host: &HostConfig) -> models::HostConfig {
    models::HostConfig {
        binds: Some(host.binds.clone()).filter(|b| !b.is_empty()),
        port_bindings: Some(port_map(host)).filter(|m| !m.is_empty()),
        volumes_from: Some(host.volumes_from.clone()).filter(|v| !v.is_empty()),
        ..Default::default()
    }
}

pub(crate) fn create_config(config: &EngineConfig, host: &HostConfig) -> Config<String> {
    // Published ports must also be exposed.
    let mut exposed: Vec<String> = config.exposed_ports.iter().map(|p| port_key(p)).collect();
    exposed.extend(port_map(host).into_keys());
    exposed.sort();
    exposed.dedup();

    Config {
        image: Some(config.image.clone()),
        hostname: Some(config.hostname.clone()).filter(|h| !h.is_empty()),
        cmd: Some(config.cmd.clone()).filter(|c| !c.is_empty()),
        env: Some(config.env.clone()).filter(|e| !e.is_empty()),
        tty: Some(config.tty),
        exposed_ports: Some(key_set(exposed.iter().map(String::as_str))).filter(|m| !m.is_empty()),
        volumes: Some(key_set(config.volumes.iter().map(String::as_str)))
            .filter(|m| !m.is_empty()),
        host_config: Some(host_config(host)),
        ..Default::default()
    }
}

fn sorted_keys<V>(map: Option<HashMap<String, V>>) -> Vec<String> {
    let mut keys: Vec<String> = map.map(|m| m.into_keys().collect()).unwrap_or_default();
    keys.sort();
    keys
}

fn bindings_from(map: Option<PortMap>) -> Vec<String> {
    let mut out = Vec::new();
    for (container, bindings) in map.unwrap_or_default() {
        for b in bindings.unwrap_or_default() {
            let host = b.host_port.unwrap_or_default();
            match b.host_ip.filter(|ip| !ip.is_empty() && ip != "0.0.0.0") {
                Some(ip) => out.push(format!("{ip}:{host}:{container}")),
                None => out.push(format!("{host}:{container}")),
            }
        }
    }
    out.sort();
    out
}

pub(crate) fn details(resp: ContainerInspectResponse) -> ContainerDetails {
    let cfg = resp.config.unwrap_or_default();
    let host = resp.host_config.unwrap_or_default();

    ContainerDetails {
        id: resp.id.unwrap_or_default(),
        name: resp
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: resp.image.unwrap_or_default(),
        running: resp.state.and_then(|s| s.running).unwrap_or(false),
        config: EngineConfig {
            image: cfg.image.unwrap_or_default(),
            hostname: cfg.hostname.unwrap_or_default(),
            cmd: cfg.cmd.unwrap_or_default(),
            env: cfg.env.unwrap_or_default(),
            tty: cfg.tty.unwrap_or(false),
            exposed_ports: sorted_keys(cfg.exposed_ports),
            volumes: sorted_keys(cfg.volumes),
        },
        host_config: HostConfig {
            binds: host.binds.unwrap_or_default(),
            port_bindings: bindings_from(host.port_bindings),
            volumes_from: host.volumes_from.unwrap_or_default(),
        },
        ip_address: resp
            .network_settings
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty()),
    }
}
