use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt, fmt::time::OffsetTime, layer::SubscriberExt,
    util::SubscriberInitExt, util::TryInitError,
};

use crate::logger::{LoggerFormat, config::LoggerConfig, error::LoggerError};

/// Engine and HTTP client crates log every request at debug; capped unless named in the level.
const TRANSPORT_CAPS: &[(&str, &str)] = &[
    ("hyper", "hyper=info"),
    ("hyper_util", "hyper_util=info"),
    ("reqwest", "reqwest=info"),
    ("bollard", "bollard=info"),
];

#[cfg(all(target_os = "linux", feature = "journald"))]
const SYSLOG_IDENTIFIER: &str = "watchdock";

pub(crate) fn install(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = mk_filter(&cfg.level)?;

    match cfg.format {
        LoggerFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(cfg.use_color)
                    .with_target(cfg.with_targets)
                    .with_timer(local_timer()),
            )
            .try_init()
            .map_err(init_error),
        LoggerFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(cfg.with_targets)
                    .with_timer(local_timer()),
            )
            .try_init()
            .map_err(init_error),
        LoggerFormat::Journald => journald(filter),
    }
}

pub(crate) fn check_level(level: &str) -> Result<(), LoggerError> {
    mk_filter(level).map(|_| ())
}

fn mk_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    let invalid = || LoggerError::InvalidLogLevel(level.to_string());
    let mut filter = EnvFilter::try_new(level).map_err(|_| invalid())?;

    for (target, cap) in TRANSPORT_CAPS {
        if level.contains(target) {
            continue;
        }
        let directive: Directive = cap.parse().map_err(|_| invalid())?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn local_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn init_error(e: TryInitError) -> LoggerError {
    let s = e.to_string();
    if s.contains("global default") || s.contains("SetGlobalDefaultError") {
        LoggerError::AlreadyInitialized
    } else {
        LoggerError::InitializationFailed(s)
    }
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald(filter: EnvFilter) -> Result<(), LoggerError> {
    let layer = tracing_journald::layer()
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))?
        .with_syslog_identifier(SYSLOG_IDENTIFIER.to_string());
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(init_error)
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald(_filter: EnvFilter) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_crates_are_capped() {
        let filter = mk_filter("debug").unwrap().to_string();
        assert!(filter.contains("bollard=info"));
        assert!(filter.contains("hyper=info"));
    }

    #[test]
    fn explicit_transport_level_wins() {
        let filter = mk_filter("info,bollard=trace").unwrap().to_string();
        assert!(filter.contains("bollard=trace"));
        assert!(!filter.contains("bollard=info"));
    }
}
