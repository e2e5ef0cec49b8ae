//! Process-wide logging setup for the watchdock agent.

mod logger;
pub use logger::*;
