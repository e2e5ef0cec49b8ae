//! `containers/<name>/<field>` key layout.

use std::collections::BTreeMap;

use watchdock_model::{ContainerSpec, ValidationError};

use crate::kv::KvPair;

pub const FIELD_IMAGE: &str = "image";
pub const FIELD_HOSTNAME: &str = "hostname";
pub const FIELD_CMD: &str = "cmd";
pub const FIELD_PORTS: &str = "ports";
pub const FIELD_VOLUMES: &str = "volumes";
pub const FIELD_VOLUMES_FROM: &str = "volumesfrom";
pub const FIELD_ENV: &str = "env";
pub const FIELD_MAX_INSTANCES: &str = "maxinstances";
pub const FIELD_PTY: &str = "pty";
pub const FIELD_WHERE: &str = "where";

/// Group pairs under `prefix` into one record per container name.
///
/// Keys with fewer than three levels or an empty field are skipped. A bad
/// value invalidates only its own record.
pub fn specs_from_pairs(
    prefix: &str,
    pairs: &[KvPair],
) -> BTreeMap<String, Result<ContainerSpec, ValidationError>> {
    let mut out: BTreeMap<String, Result<ContainerSpec, ValidationError>> = BTreeMap::new();

    for pair in pairs {
        let Some(rest) = pair.key.strip_prefix(prefix) else {
            continue;
        };
        let mut levels = rest.trim_start_matches('/').splitn(2, '/');
        let (Some(name), Some(field)) = (levels.next(), levels.next()) else {
            continue;
        };
        if name.is_empty() || field.is_empty() {
            continue;
        }

        let entry = out
            .entry(name.to_string())
            .or_insert_with(|| Ok(ContainerSpec::new(name, "")));
        let value = String::from_utf8_lossy(&pair.value);
        let applied = match &mut *entry {
            Ok(spec) => apply_field(spec, field, value.trim()),
            Err(_) => continue,
        };
        if let Err(e) = applied {
            *entry = Err(e);
        }
    }

    out.into_iter()
        .map(|(name, res)| (name, res.and_then(ContainerSpec::validated)))
        .collect()
}

fn apply_field(spec: &mut ContainerSpec, field: &str, value: &str) -> Result<(), ValidationError> {
    match field {
        FIELD_IMAGE => spec.image = value.to_string(),
        FIELD_HOSTNAME => spec.hostname = value.to_string(),
        FIELD_CMD => spec.cmd = parse_cmd(value),
        FIELD_PORTS => spec.ports = split_list(value),
        FIELD_VOLUMES => spec.volumes = split_list(value),
        FIELD_VOLUMES_FROM => spec.volumes_from = split_list(value),
        FIELD_ENV => spec.env = split_list(value),
        FIELD_WHERE => spec.placement = split_list(value),
        FIELD_PTY => spec.pty = value == "true",
        FIELD_MAX_INSTANCES => {
            spec.max_instances = if value.is_empty() {
                0
            } else {
                value.parse().map_err(|_| ValidationError::InvalidField {
                    field: "MaxInstances",
                    value: value.to_string(),
                })?
            }
        }
        _ => {}
    }
    Ok(())
}

/// JSON array if possible, whitespace-separated words otherwise.
fn parse_cmd(value: &str) -> Vec<String> {
    if value.starts_with('[')
        && let Ok(args) = serde_json::from_str::<Vec<String>>(value)
    {
        return args;
    }
    value.split_whitespace().map(str::to_string).collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Every field of `spec` as a pair, empty ones included so stale values get overwritten.
pub fn pairs_from_spec(prefix: &str, spec: &ContainerSpec) -> Vec<KvPair> {
    let base = format!("{}/{}", prefix.trim_end_matches('/'), spec.name);
    let cmd = if spec.cmd.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&spec.cmd).unwrap_or_default()
    };
    let max_instances = if spec.max_instances == 0 {
        String::new()
    } else {
        spec.max_instances.to_string()
    };

    [
        (FIELD_IMAGE, spec.image.clone()),
        (FIELD_HOSTNAME, spec.hostname.clone()),
        (FIELD_CMD, cmd),
        (FIELD_PORTS, spec.ports.join(",")),
        (FIELD_VOLUMES, spec.volumes.join(",")),
        (FIELD_VOLUMES_FROM, spec.volumes_from.join(",")),
        (FIELD_ENV, spec.env.join(",")),
        (FIELD_MAX_INSTANCES, max_instances),
        (FIELD_PTY, spec.pty.to_string()),
        (FIELD_WHERE, spec.placement.join(",")),
    ]
    .into_iter()
    .map(|(field, value)| KvPair::new(format!("{base}/{field}"), value))
    .collect()
}

/// What `spec` looks like after a trip through the key-value layout.
pub fn as_stored(prefix: &str, spec: &ContainerSpec) -> ContainerSpec {
    let pairs = pairs_from_spec(prefix, spec);
    match specs_from_pairs(prefix, &pairs).remove(&spec.name) {
        Some(Ok(stored)) => stored,
        _ => spec.clone(),
    }
}
