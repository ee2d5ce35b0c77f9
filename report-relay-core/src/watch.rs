//! Bridge from `notify`'s callback thread into the async intake pump.
//!
//! The callback never blocks. Each native event is converted into zero or more
//! [`FsEvent`]s and `try_send`-ed into a bounded channel. When the channel is full the
//! watcher raises an overflow flag instead, which the pump turns into a full directory
//! scan. Watcher errors travel through the same channel as [`WatchSignal::Error`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Capacity of the channel between the watcher callback and the pump.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    Deleted(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Event(FsEvent),
    /// Events were lost; the directory has to be rescanned.
    Overflow,
    /// The watch facility reported an internal error.
    Error(String),
}

/// Maps a native event onto the pipeline's vocabulary.
///
/// Rename halves are split: the old name is a deletion and the new name a creation.
/// An ambiguous rename (platforms that cannot tell the halves apart) is reported as a
/// modification; the pipeline stats the path and treats a missing file as deleted.
/// Access and metadata-only events are ignored.
pub fn convert_event(event: &notify::Event) -> Vec<FsEvent> {
    let paths = &event.paths;
    match event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(FsEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            vec![FsEvent::Renamed {
                from: paths[0].clone(),
                to: paths[1].clone(),
            }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(FsEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(FsEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths.iter().cloned().map(FsEvent::Modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// A live, non-recursive watch on one directory. Dropping it deregisters the watch.
pub struct DirectoryWatcher {
    directory: PathBuf,
    overflowed: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("directory", &self.directory)
            .field("overflowed", &self.overflowed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DirectoryWatcher {
    pub fn start(directory: &Path, signals: mpsc::Sender<WatchSignal>) -> Result<Self, WatchError> {
        let overflowed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&overflowed);

        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                let outgoing = match res {
                    Ok(event) if event.need_rescan() => vec![WatchSignal::Overflow],
                    Ok(event) => convert_event(&event)
                        .into_iter()
                        .map(WatchSignal::Event)
                        .collect(),
                    Err(e) => vec![WatchSignal::Error(e.to_string())],
                };
                for signal in outgoing {
                    match signals.try_send(signal) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            if !flag.swap(true, Ordering::Relaxed) {
                                warn!("[INTAKE] Watch channel full, falling back to a rescan");
                            }
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            },
        )
        .map_err(WatchError::Create)?;

        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: directory.to_path_buf(),
                source,
            })?;

        info!(directory = %directory.display(), "[INTAKE] Filesystem watcher started");
        Ok(Self {
            directory: directory.to_path_buf(),
            overflowed,
            _watcher: watcher,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns `true` once per overflow, clearing the flag.
    pub fn take_overflow(&self) -> bool {
        let was_set = self.overflowed.swap(false, Ordering::Relaxed);
        if was_set {
            debug!(directory = %self.directory.display(), "[INTAKE] Watcher overflow observed");
        }
        was_set
    }
}
