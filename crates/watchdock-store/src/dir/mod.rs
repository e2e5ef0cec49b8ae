//! Filesystem backend: one JSON file per container, `<Name>.json`.

mod ledger;
pub use ledger::ModTimeLedger;

mod watch;
pub use watch::FsChange;

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use serde_json::Value;
use watchdock_model::{Event, EventKind, Origin, ValidationError};

use crate::{EventRx, EventTx, StateStore, StoreError, dir::watch::WatchGuard};

/// Window after a write during which notifications for that file are echoes.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

pub const DEFAULT_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct DirConfig {
    pub directory: PathBuf,
    /// Extension of record files, without the dot.
    pub extension: String,
    pub grace: Duration,
}

impl DirConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Directory-backed [`StateStore`].
pub struct DirStore {
    cfg: DirConfig,
    ledger: ModTimeLedger,
    label: String,
}

impl DirStore {
    /// Open (and create if missing) the record directory.
    pub fn new(cfg: DirConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&cfg.directory)?;
        let label = format!("dir:{}", cfg.directory.display());
        Ok(Self {
            ledger: ModTimeLedger::new(cfg.grace),
            cfg,
            label,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.cfg.directory
    }

    pub fn ledger(&self) -> &ModTimeLedger {
        &self.ledger
    }

    /// Backing file for a container name.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.cfg
            .directory
            .join(format!("{name}.{}", self.cfg.extension))
    }

    fn is_record_file(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(self.cfg.extension.as_str())
    }

    /// Parse a record file; the record must name the file it is stored in.
    fn read_record(path: &Path) -> Result<Event, StoreError> {
        let raw = std::fs::read(path)?;
        let value: Value = serde_json::from_slice(&raw)?;
        let event = Event::from_record(value, Origin::Store)?;

        let stored = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if event.name() != stored {
            return Err(ValidationError::NameMismatch {
                name: event.name().to_string(),
                stored,
            }
            .into());
        }
        Ok(event)
    }

    /// A record carrying the delete sentinel is consumed: the file goes away with the entry.
    fn consume_sentinel(&mut self, path: &Path) {
        self.ledger.remove(path);
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed delete request file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot remove delete request file")
            }
        }
    }

    /// List the directory and register every valid record in the ledger.
    pub fn scan(&mut self) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::new();

        for entry in std::fs::read_dir(&self.cfg.directory)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || !self.is_record_file(&path) {
                trace!(path = %path.display(), "not a record file");
                continue;
            }
            let event = match Self::read_record(&path) {
                Ok(event) => event,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "found invalid record file");
                    continue;
                }
            };
            if event.is_tombstone() {
                info!(name = %event.name(), "found delete request");
                self.consume_sentinel(&path);
                out.push(event);
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or_else(|_| SystemTime::now());

            debug!(path = %path.display(), name = %event.name(), "found valid record file");
            self.ledger.record(path, mtime);
            out.push(event);
        }
        Ok(out)
    }

    /// React to one filesystem change; returns the event to emit, if any.
    pub fn on_change(&mut self, change: FsChange) -> Option<Event> {
        self.on_change_at(change, SystemTime::now())
    }

    pub(crate) fn on_change_at(&mut self, change: FsChange, now: SystemTime) -> Option<Event> {
        if !self.is_record_file(change.path()) {
            return None;
        }
        match change {
            FsChange::Write(path) => {
                let event = match Self::read_record(&path) {
                    Ok(event) => event,
                    Err(StoreError::Invalid(e @ ValidationError::NameMismatch { .. })) => {
                        warn!(path = %path.display(), error = %e, "ignoring misnamed record");
                        return None;
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "ignoring invalid write");
                        return None;
                    }
                };
                if self.ledger.is_echo(&path, now) {
                    trace!(path = %path.display(), "ignoring echo of own write");
                    return None;
                }
                if event.is_tombstone() {
                    info!(name = %event.name(), "delete requested");
                    self.consume_sentinel(&path);
                } else {
                    info!(name = %event.name(), "record changed");
                    self.ledger.record(path, now);
                }
                Some(event)
            }
            FsChange::Remove(path) => {
                if !self.ledger.contains(&path) {
                    trace!(path = %path.display(), "ignoring removal of untracked file");
                    return None;
                }
                let name = path.file_stem()?.to_string_lossy().into_owned();
                self.ledger.remove(&path);
                info!(%name, "record removed");
                Some(Event::tombstone(name, Origin::Store))
            }
        }
    }

    /// Persist an event coming from the runtime.
    #[instrument(
        level = "debug",
        skip(self, event),
        fields(name = %event.name(), kind = ?event.kind())
    )]
    pub async fn apply(&mut self, event: &Event) -> Result<(), StoreError> {
        if event.origin() == Origin::Store {
            trace!("ignoring event produced by a store");
            return Ok(());
        }
        let path = self.path_for(event.name());

        match event.kind() {
            EventKind::Tombstone => {
                self.ledger.remove(&path);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(path = %path.display(), "record deleted"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        debug!(path = %path.display(), "record already absent")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            EventKind::Upsert => {
                let body = serde_json::to_vec_pretty(&event.to_record()?)?;
                // Must precede the write: the watcher may fire before write() returns.
                self.ledger.record(path.clone(), SystemTime::now());
                tokio::fs::write(&path, body).await?;
                debug!(path = %path.display(), "record written");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for DirStore {
    fn name(&self) -> &str {
        &self.label
    }

    async fn start(&mut self, outbound: &EventTx) -> Result<usize, StoreError> {
        let events = self.scan()?;
        let n = events.len();
        for ev in events {
            if outbound.send(ev).is_err() {
                break;
            }
        }
        info!(store = %self.label, records = n, "initial scan complete");
        Ok(n)
    }

    async fn sync(
        &mut self,
        mut inbound: EventRx,
        outbound: EventTx,
        shutdown: CancellationToken,
    ) -> Result<(), StoreError> {
        let (_guard, mut changes) = WatchGuard::start(&self.cfg.directory)?;
        info!(store = %self.label, "watching for changes");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(store = %self.label, "shutdown requested");
                    return Ok(());
                }
                Some(res) = changes.recv() => match res {
                    Ok(raw) => {
                        for change in FsChange::from_notify(raw) {
                            if let Some(ev) = self.on_change(change)
                                && outbound.send(ev).is_err()
                            {
                                debug!(store = %self.label, "runtime side closed");
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => warn!(store = %self.label, error = %e, "watch error"),
                },
                msg = inbound.recv() => match msg {
                    Some(ev) => {
                        if let Err(e) = self.apply(&ev).await {
                            warn!(
                                store = %self.label,
                                name = %ev.name(),
                                error = %e,
                                "failed to persist event"
                            );
                        }
                    }
                    None => {
                        debug!(store = %self.label, "inbound channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}
