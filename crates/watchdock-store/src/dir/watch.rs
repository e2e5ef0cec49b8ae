use std::path::{Path, PathBuf};

use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::StoreError;

/// Change to one backing file, reduced to what the store cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Write(PathBuf),
    Remove(PathBuf),
}

impl FsChange {
    /// Map a raw notify event; access and metadata-only events yield nothing.
    pub fn from_notify(event: notify::Event) -> Vec<FsChange> {
        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Create(_) => paths.map(FsChange::Write).collect(),
            EventKind::Remove(_) => paths.map(FsChange::Remove).collect(),
            EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                paths.map(FsChange::Remove).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut out = Vec::new();
                if let Some(from) = paths.next() {
                    out.push(FsChange::Remove(from));
                }
                out.extend(paths.map(FsChange::Write));
                out
            }
            EventKind::Modify(_) => paths.map(FsChange::Write).collect(),
            _ => Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            FsChange::Write(p) | FsChange::Remove(p) => p,
        }
    }
}

pub(crate) type NotifyRx = mpsc::UnboundedReceiver<notify::Result<notify::Event>>;

/// Live watch on one directory; dropping it releases the watch descriptor.
pub(crate) struct WatchGuard {
    watcher: RecommendedWatcher,
    path: PathBuf,
}

impl WatchGuard {
    pub(crate) fn start(path: &Path) -> Result<(Self, NotifyRx), StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Receiver gone means the store loop has exited.
            let _ = tx.send(res);
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        debug!(path = %path.display(), "watch installed");

        Ok((
            Self {
                watcher,
                path: path.to_path_buf(),
            },
            rx,
        ))
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Err(e) = self.watcher.unwatch(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release watch");
        } else {
            debug!(path = %self.path.display(), "watch released");
        }
    }
}

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    use super::*;

    fn ev(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut e = notify::Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn writes_and_removes_are_classified() {
        assert_eq!(
            FsChange::from_notify(ev(EventKind::Create(CreateKind::File), &["/d/a.json"])),
            vec![FsChange::Write("/d/a.json".into())]
        );
        assert_eq!(
            FsChange::from_notify(ev(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/d/a.json"]
            )),
            vec![FsChange::Write("/d/a.json".into())]
        );
        assert_eq!(
            FsChange::from_notify(ev(EventKind::Remove(RemoveKind::File), &["/d/a.json"])),
            vec![FsChange::Remove("/d/a.json".into())]
        );
    }

    #[test]
    fn rename_splits_into_remove_and_write() {
        let changes = FsChange::from_notify(ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/.a.json.tmp", "/d/a.json"],
        ));
        assert_eq!(
            changes,
            vec![
                FsChange::Remove("/d/.a.json.tmp".into()),
                FsChange::Write("/d/a.json".into())
            ]
        );
    }

    #[test]
    fn metadata_and_access_are_ignored() {
        assert!(
            FsChange::from_notify(ev(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                &["/d/a.json"]
            ))
            .is_empty()
        );
        assert!(FsChange::from_notify(ev(EventKind::Any, &["/d/a.json"])).is_empty());
    }
}
