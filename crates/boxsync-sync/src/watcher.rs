//! File watching
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! sync root recursively, converting raw OS events into [`RawFsEvent`]
//! values on a bounded channel. Coalescing is left to the
//! [`Debouncer`](crate::debouncer::Debouncer).
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / FSEvents
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  run_debounce_loop  ──→  Reconciler driver
//! ```
//!
//! ## Renames
//!
//! inotify reports a move as `Name(From)` and `Name(To)` sharing a tracker
//! cookie, followed by a combined `Name(Both)`. The halves are forwarded as
//! `Removed`/`Created` carrying the tracker, so a move out of (or into) the
//! root still reads as a delete (or create); the debouncer re-pairs matching
//! halves into a rename. `Name(Both)` is only used when the backend supplies
//! no tracker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the raw event channel
const RAW_EVENT_CAPACITY: usize = 1024;

// ============================================================================
// RawFsEvent
// ============================================================================

/// Kind of a raw filesystem event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
    /// The item at `from` is now at the event's path
    Renamed { from: PathBuf },
}

/// A filesystem event as reported by the OS, before coalescing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFsEvent {
    pub kind: RawKind,
    /// Absolute path (the destination for renames)
    pub path: PathBuf,
    /// Whether the item is a directory, when known
    pub is_folder: Option<bool>,
    /// Rename cookie pairing the two halves of a move
    pub tracker: Option<usize>,
}

impl RawFsEvent {
    pub fn new(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_folder: None,
            tracker: None,
        }
    }

    #[must_use]
    pub fn folder(mut self, is_folder: bool) -> Self {
        self.is_folder = Some(is_folder);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: usize) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root for changes using the OS-native mechanism
///
/// ## Usage
///
/// ```ignore
/// let (mut watcher, rx) = FileWatcher::new()?;
/// watcher.watch(Path::new("/home/user/Boxsync"))?;
/// // rx.recv().await to get events
/// drop(watcher); // stops watching and closes the channel
/// ```
pub struct FileWatcher {
    /// The underlying notify watcher instance
    watcher: RecommendedWatcher,
    watched: Option<PathBuf>,
}

impl FileWatcher {
    /// Creates a new `FileWatcher`
    ///
    /// Returns the watcher and a receiver channel for consuming raw events.
    /// The channel closes once the watcher is dropped.
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<RawFsEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<RawFsEvent>(RAW_EVENT_CAPACITY);

        info!("Initializing file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for raw in map_notify_event(&event) {
                        if let Err(e) = event_tx.blocking_send(raw) {
                            warn!(error = %e, "Failed to send raw event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((
            Self {
                watcher,
                watched: None,
            },
            event_rx,
        ))
    }

    /// Starts watching a directory recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (e.g., does not exist,
    /// insufficient permissions, or inotify watch limit reached)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");

        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))?;
        self.watched = Some(path.to_path_buf());
        Ok(())
    }

    /// Stops watching the directory passed to [`FileWatcher::watch`]
    pub fn unwatch(&mut self) {
        if let Some(path) = self.watched.take() {
            info!(path = %path.display(), "Stopping watch");
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!(error = %e, "Unwatch failed");
            }
        }
    }

    /// The watched directory, if any
    pub fn watched_path(&self) -> Option<&Path> {
        self.watched.as_deref()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}

// ============================================================================
// Event mapping - notify::Event → RawFsEvent
// ============================================================================

fn stat_is_dir(path: &Path) -> Option<bool> {
    std::fs::symlink_metadata(path).ok().map(|m| m.is_dir())
}

/// Converts a `notify::Event` into raw events
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> `Created`
/// - `Modify(Data(*))`, `Modify(Metadata(*))`, `Modify(Any)` -> `Modified`
/// - `Modify(Name(From))` -> `Removed` (with tracker)
/// - `Modify(Name(To))` -> `Created` (with tracker)
/// - `Modify(Name(Both))` with 2 paths and no tracker -> `Renamed`
/// - `Remove(*)` -> `Removed`
///
/// Access events and events without paths are ignored.
pub(crate) fn map_notify_event(event: &notify::Event) -> Vec<RawFsEvent> {
    let paths = &event.paths;
    let tracker = event.attrs.tracker();

    let Some(first) = paths.first() else {
        return Vec::new();
    };

    let mapped = match &event.kind {
        EventKind::Create(kind) => {
            let is_folder = match kind {
                notify::event::CreateKind::Folder => Some(true),
                notify::event::CreateKind::File => Some(false),
                _ => stat_is_dir(first),
            };
            let mut raw = RawFsEvent::new(RawKind::Created, first.clone());
            raw.is_folder = is_folder;
            vec![raw]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            let mut raw = RawFsEvent::new(RawKind::Removed, first.clone());
            raw.tracker = tracker;
            vec![raw]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let mut raw = RawFsEvent::new(RawKind::Created, first.clone());
            raw.is_folder = stat_is_dir(first);
            raw.tracker = tracker;
            vec![raw]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if tracker.is_some() {
                // Already delivered as From/To halves
                Vec::new()
            } else if paths.len() >= 2 {
                let mut raw = RawFsEvent::new(
                    RawKind::Renamed {
                        from: paths[0].clone(),
                    },
                    paths[1].clone(),
                );
                raw.is_folder = stat_is_dir(&paths[1]);
                vec![raw]
            } else {
                vec![RawFsEvent::new(RawKind::Modified, first.clone())]
            }
        }

        EventKind::Modify(ModifyKind::Name(_)) => {
            // Backends that cannot tell which side of a rename this is
            match stat_is_dir(first) {
                Some(is_folder) => {
                    vec![RawFsEvent::new(RawKind::Created, first.clone()).folder(is_folder)]
                }
                None => vec![RawFsEvent::new(RawKind::Removed, first.clone())],
            }
        }

        EventKind::Modify(_) => {
            let mut raw = RawFsEvent::new(RawKind::Modified, first.clone());
            raw.is_folder = stat_is_dir(first);
            if raw.is_folder == Some(true) {
                // Directory mtime changes carry no content
                return Vec::new();
            }
            vec![raw]
        }

        EventKind::Remove(kind) => {
            let mut raw = RawFsEvent::new(RawKind::Removed, first.clone());
            raw.is_folder = match kind {
                RemoveKind::Folder => Some(true),
                RemoveKind::File => Some(false),
                _ => None,
            };
            vec![raw]
        }

        _ => Vec::new(),
    };

    for raw in &mapped {
        trace!(kind = ?raw.kind, path = %raw.path.display(), "Mapped notify event");
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_map_create_event() {
        let mapped = map_notify_event(&event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/root/a.txt"],
        ));
        assert_eq!(
            mapped,
            vec![RawFsEvent::new(RawKind::Created, "/root/a.txt").folder(false)]
        );
    }

    #[test]
    fn test_map_modify_data_event() {
        let mapped = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            &["/nonexistent/a.txt"],
        ));
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].kind, RawKind::Modified);
    }

    #[test]
    fn test_map_rename_halves_keep_tracker() {
        let from = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/nonexistent/old.txt"],
        )
        .set_tracker(7);
        let to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/nonexistent/new.txt"],
        )
        .set_tracker(7);
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nonexistent/old.txt", "/nonexistent/new.txt"],
        )
        .set_tracker(7);

        let from = map_notify_event(&from);
        assert_eq!(from[0].kind, RawKind::Removed);
        assert_eq!(from[0].tracker, Some(7));

        let to = map_notify_event(&to);
        assert_eq!(to[0].kind, RawKind::Created);
        assert_eq!(to[0].tracker, Some(7));

        assert!(map_notify_event(&both).is_empty());
    }

    #[test]
    fn test_map_rename_both_without_tracker() {
        let mapped = map_notify_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nonexistent/old.txt", "/nonexistent/new.txt"],
        ));
        assert_eq!(
            mapped[0].kind,
            RawKind::Renamed {
                from: PathBuf::from("/nonexistent/old.txt")
            }
        );
        assert_eq!(mapped[0].path, PathBuf::from("/nonexistent/new.txt"));
    }

    #[test]
    fn test_map_remove_folder_event() {
        let mapped = map_notify_event(&event(
            EventKind::Remove(RemoveKind::Folder),
            &["/root/dir"],
        ));
        assert_eq!(
            mapped,
            vec![RawFsEvent::new(RawKind::Removed, "/root/dir").folder(true)]
        );
    }

    #[test]
    fn test_map_access_event_ignored() {
        let mapped = map_notify_event(&event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/root/a.txt"],
        ));
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_map_event_no_paths() {
        let mapped = map_notify_event(&event(
            EventKind::Create(notify::event::CreateKind::File),
            &[],
        ));
        assert!(mapped.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut rx) = FileWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();
        assert_eq!(watcher.watched_path(), Some(dir.path()));

        let file = dir.path().join("hello.txt");
        tokio::fs::write(&file, b"hi").await.unwrap();

        let raw = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(raw) if raw.path == file => break raw,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no event for created file");
        assert!(matches!(raw.kind, RawKind::Created | RawKind::Modified));
    }
}
