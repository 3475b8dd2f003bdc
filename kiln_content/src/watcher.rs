use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use kiln_shared::{
    crossbeam_channel::{self, Receiver, Sender},
    log::{error, trace, warn},
};
use notify_debouncer_full::{
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap,
};

use crate::{
    common::{is_meta_file, TEMPORARY_EXTENSION},
    Error, Result,
};

/// Change in a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    FileChanged(PathBuf),
    DirectoryChanged(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::FileChanged(path) | WatchEvent::DirectoryChanged(path) | WatchEvent::Removed(path) => path,
        }
    }
}

/// Watches the content directories and forwards the changes to a channel.
///
/// The watcher thread only sends [`WatchEvent`]s. They are handled when the receiver is drained.
pub struct ContentWatcher {
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    receiver: Receiver<WatchEvent>,
    watched: BTreeSet<PathBuf>,
}

impl ContentWatcher {
    /// Creates a watcher that reports changes after they settled for `delay`.
    pub fn new(delay: Duration) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let debouncer = notify_debouncer_full::new_debouncer(delay, None, move |result: DebounceEventResult| {
            forward_events(result, &sender)
        })
        .map_err(|_| Error::FailedToStartDirectoryWatcher(PathBuf::new()))?;
        Ok(Self {
            debouncer,
            receiver,
            watched: BTreeSet::new(),
        })
    }

    /// Watches `path` recursively. Directories that are already covered by a watched directory are skipped.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        if self.is_watched(path) {
            return Ok(());
        }
        self.debouncer
            .watcher()
            .watch(path, RecursiveMode::Recursive)
            .map_err(|_| Error::FailedToStartDirectoryWatcher(path.to_owned()))?;
        trace!("Watching {path:?}");
        self.watched.insert(path.to_owned());
        Ok(())
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.watched.iter().any(|watched| path.starts_with(watched))
    }

    /// Returns the changes that were reported since the last call.
    pub fn try_iter(&self) -> impl Iterator<Item = WatchEvent> + '_ {
        self.receiver.try_iter()
    }

    pub fn receiver(&self) -> &Receiver<WatchEvent> {
        &self.receiver
    }
}

fn forward_events(result: DebounceEventResult, sender: &Sender<WatchEvent>) {
    match result {
        Ok(events) => {
            for event in events {
                for watch_event in translate(&event) {
                    trace!("Watcher reported {watch_event:?}");
                    if let Err(err) = sender.send(watch_event) {
                        warn!("Failed to forward the change of a watched file: {err}");
                    }
                }
            }
        }
        Err(err) => {
            let errs = err.into_iter().map(|err| err.to_string()).collect::<Vec<_>>().join(", ");
            error!("Failed to receive events from file watcher: {errs}");
        }
    }
}

fn translate(event: &DebouncedEvent) -> Vec<WatchEvent> {
    event
        .paths
        .iter()
        .filter_map(|path| classify(&event.kind, path))
        .collect()
}

/// Translates a file system event. Sidecar and temporary files are ignored.
fn classify(kind: &EventKind, path: &Path) -> Option<WatchEvent> {
    let is_temporary = path.extension().and_then(|extension| extension.to_str()) == Some(TEMPORARY_EXTENSION);
    if is_meta_file(path) || is_temporary {
        return None;
    }
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            if path.is_dir() {
                Some(WatchEvent::DirectoryChanged(path.to_owned()))
            } else if path.exists() {
                Some(WatchEvent::FileChanged(path.to_owned()))
            } else {
                // Renames report the old path as modified.
                Some(WatchEvent::Removed(path.to_owned()))
            }
        }
        EventKind::Remove(_) => Some(WatchEvent::Removed(path.to_owned())),
        _ => None,
    }
}
