use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

/// Last-written time per backing file.
///
/// A change notification within `grace` of the recorded time is an echo of
/// our own write (or of the scan that registered the file).
#[derive(Debug)]
pub struct ModTimeLedger {
    entries: HashMap<PathBuf, SystemTime>,
    grace: Duration,
}

impl ModTimeLedger {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            grace,
        }
    }

    pub fn record(&mut self, path: impl Into<PathBuf>, at: SystemTime) {
        self.entries.insert(path.into(), at);
    }

    /// Whether a notification for `path` observed at `now` is an echo.
    ///
    /// A recorded time ahead of `now` counts as inside the window.
    pub fn is_echo(&self, path: &Path, now: SystemTime) -> bool {
        match self.entries.get(path) {
            Some(at) => match now.duration_since(*at) {
                Ok(elapsed) => elapsed < self.grace,
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }
}
