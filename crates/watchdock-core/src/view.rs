use tracing::{debug, info, trace, warn};

use crate::EngineEvent;

#[inline]
pub fn message_for(status: &str) -> &'static str {
    match status {
        "create" => "container created",
        "start" => "container started",
        "restart" => "container restarted",
        "stop" => "container stopped",
        "kill" => "container killed",
        "die" => "container exited",
        "oom" => "container ran out of memory",
        "destroy" => "container destroyed",
        "pause" | "unpause" => "container pause state changed",
        "rename" => "container renamed",
        _ => "container event",
    }
}

#[inline]
pub fn log_engine_event(e: &EngineEvent) {
    let msg = message_for(&e.status);
    let name = e.name.as_deref().unwrap_or("unknown");

    match e.status.as_str() {
        "die" | "oom" => warn!(id = %e.id, name, status = %e.status, "{msg}"),
        "create" | "start" | "restart" | "stop" | "destroy" => {
            info!(id = %e.id, name, "{msg}")
        }
        "kill" | "pause" | "unpause" | "rename" => debug!(id = %e.id, name, "{msg}"),
        _ => trace!(id = %e.id, name, status = %e.status, "{msg}"),
    }
}
