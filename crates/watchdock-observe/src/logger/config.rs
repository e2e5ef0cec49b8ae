use crate::logger::{error::LoggerError, format::LoggerFormat};

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directive, e.g. `info` or `watchdock_core=debug,info`.
    pub level: String,
    /// Print the event target (`watchdock::store`, `watchdock::runtime`, ...).
    pub with_targets: bool,
    pub use_color: bool,
}

impl LoggerConfig {
    /// Build from CLI strings, validating both.
    pub fn from_flags(level: &str, format: &str) -> Result<Self, LoggerError> {
        let format = format.parse()?;
        crate::logger::log::check_level(level)?;
        Ok(Self {
            format,
            level: level.to_string(),
            ..Default::default()
        })
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let use_color = cfg!(test) || atty::is(atty::Stream::Stdout);
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flags_accepts_directives() {
        let cfg = LoggerConfig::from_flags("watchdock_core=debug,info", "JSON").unwrap();
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert_eq!(cfg.level, "watchdock_core=debug,info");
        assert!(cfg.with_targets);
    }

    #[test]
    fn from_flags_rejects_bad_level() {
        let err = LoggerConfig::from_flags("info,watchdock=loud", "text").unwrap_err();
        assert!(matches!(err, LoggerError::InvalidLogLevel(_)));
    }
}
