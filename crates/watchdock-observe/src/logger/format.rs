use std::{fmt, str::FromStr};

use crate::logger::error::LoggerError;

const JOURNALD_BUILT: bool = cfg!(all(target_os = "linux", feature = "journald"));

/// Output shape of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerFormat {
    /// Human readable lines, colored on a terminal.
    Text,
    /// One JSON object per event.
    Json,
    Journald,
}

impl fmt::Display for LoggerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Journald => "journald",
        })
    }
}

impl FromStr for LoggerFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "journald" | "journal" if JOURNALD_BUILT => Ok(Self::Journald),
            "journald" | "journal" => Err(LoggerError::JournaldNotSupported),
            _ => Err(LoggerError::InvalidFormat(s.to_string())),
        }
    }
}
