use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format {0:?}; use text, json or journald")]
    InvalidFormat(String),
    #[error("journald output needs Linux and the `journald` feature")]
    JournaldNotSupported,
    #[error("a global logger is already installed")]
    AlreadyInitialized,
    #[error("logger setup failed: {0}")]
    InitializationFailed(String),
    #[error("cannot parse log level {0:?}")]
    InvalidLogLevel(String),
}
