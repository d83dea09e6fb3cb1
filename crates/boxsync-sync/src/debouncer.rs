//! Debounced change coalescing
//!
//! The [`Debouncer`] buffers raw filesystem events per path and emits one
//! [`ChangeModel`] per path once the path has been quiet for the configured
//! window. Each buffered entry holds the *net* change against the last
//! state the reconciler saw, so bursts such as editor safe-saves collapse:
//!
//! | buffered  | new event | result                              |
//! |-----------|-----------|-------------------------------------|
//! | created   | removed   | nothing                             |
//! | created   | modified  | created                             |
//! | modified  | removed   | deleted                             |
//! | deleted   | created   | modified (file) / nothing (folder)  |
//! | renamed   | renamed   | one rename, oldest source to newest |
//! | renamed   | removed   | deleted at the original path        |
//! | created   | renamed   | created at the new path             |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use boxsync_core::domain::{newtypes::RelativePath, ChangeModel, Direction, SyncPath};

use crate::filesystem::PARTIAL_SUFFIX;
use crate::watcher::{RawFsEvent, RawKind};

/// Smallest tick of the debounce loop
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Net {
    Created,
    Modified,
    Deleted,
    Renamed { from: RelativePath, modified: bool },
}

#[derive(Debug, Clone)]
struct Pending {
    net: Net,
    is_folder: Option<bool>,
    last_event: Instant,
    seq: u64,
}

/// First half of a tracked move, kept until the second half shows up
#[derive(Debug)]
struct MovedOut {
    path: RelativePath,
    /// Buffered state of the path and its descendants before the removal
    prior: Vec<(RelativePath, Pending)>,
    at: Instant,
}

/// Per-path delay-and-coalesce buffer for raw filesystem events
pub struct Debouncer {
    root: SyncPath,
    quiet: Duration,
    ignore_suffixes: Vec<String>,
    ignored_dirs: Vec<PathBuf>,
    pending: HashMap<RelativePath, Pending>,
    moved_out: HashMap<usize, MovedOut>,
    seq: u64,
}

impl Debouncer {
    pub fn new(root: SyncPath, quiet: Duration) -> Self {
        Self {
            root,
            quiet,
            ignore_suffixes: vec![PARTIAL_SUFFIX.to_string()],
            ignored_dirs: Vec::new(),
            pending: HashMap::new(),
            moved_out: HashMap::new(),
            seq: 0,
        }
    }

    /// Also ignore files whose name ends with one of `suffixes`
    #[must_use]
    pub fn with_ignore_suffixes(mut self, suffixes: impl IntoIterator<Item = String>) -> Self {
        for suffix in suffixes {
            if !suffix.is_empty() && !self.ignore_suffixes.contains(&suffix) {
                self.ignore_suffixes.push(suffix);
            }
        }
        self
    }

    /// Ignore everything below `dir` (the index directory, for instance)
    #[must_use]
    pub fn with_ignored_dir(mut self, dir: PathBuf) -> Self {
        self.ignored_dirs.push(dir);
        self
    }

    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    /// Number of paths with buffered state
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Feed one raw event, stamped with the current time
    pub fn observe(&mut self, raw: RawFsEvent) -> Vec<ChangeModel> {
        self.observe_at(raw, Instant::now())
    }

    /// Feed one raw event observed at `now`
    ///
    /// Returns changes only when the event displaced buffered state that
    /// could not be merged; that state is released immediately, a rename
    /// together with its trailing modification.
    pub fn observe_at(&mut self, raw: RawFsEvent, now: Instant) -> Vec<ChangeModel> {
        trace!(kind = ?raw.kind, path = %raw.path.display(), "Debouncer observe");

        match raw.kind {
            RawKind::Created => {
                let Some(path) = self.relative(&raw.path) else {
                    return Vec::new();
                };
                if let Some(out) = raw.tracker.and_then(|t| self.moved_out.remove(&t)) {
                    return self.apply_move_in(out, path, raw.is_folder, now);
                }
                self.apply_created(path, raw.is_folder, now)
            }
            RawKind::Modified => {
                if let Some(path) = self.relative(&raw.path) {
                    if raw.is_folder != Some(true) {
                        self.apply_modified(path, now);
                    }
                }
                Vec::new()
            }
            RawKind::Removed => {
                let Some(path) = self.relative(&raw.path) else {
                    return Vec::new();
                };
                if let Some(tracker) = raw.tracker {
                    let prior = self.snapshot_subtree(&path);
                    self.moved_out.insert(
                        tracker,
                        MovedOut {
                            path: path.clone(),
                            prior,
                            at: now,
                        },
                    );
                }
                self.apply_removed(path, raw.is_folder, now);
                Vec::new()
            }
            RawKind::Renamed { from } => {
                let from = self.relative(&from);
                let to = self.relative(&raw.path);
                match (from, to) {
                    (Some(from), Some(to)) => self.apply_renamed(from, to, raw.is_folder, now),
                    (None, Some(to)) => self.apply_created(to, raw.is_folder, now),
                    (Some(from), None) => {
                        self.apply_removed(from, raw.is_folder, now);
                        Vec::new()
                    }
                    (None, None) => Vec::new(),
                }
            }
        }
    }

    /// Release every path that has been quiet for the full window
    pub fn poll(&mut self, now: Instant) -> Vec<ChangeModel> {
        let quiet = self.quiet;
        self.moved_out
            .retain(|_, out| now.saturating_duration_since(out.at) < quiet);

        let mut ready: Vec<(RelativePath, Pending)> = Vec::new();
        let due: Vec<RelativePath> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_event) >= quiet)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            if let Some(p) = self.pending.remove(&path) {
                ready.push((path, p));
            }
        }

        Self::emit(ready)
    }

    /// Release everything immediately, ignoring the quiet window
    pub fn flush(&mut self) -> Vec<ChangeModel> {
        self.moved_out.clear();
        let all: Vec<_> = self.pending.drain().collect();
        if !all.is_empty() {
            debug!(count = all.len(), "Flushing debouncer");
        }
        Self::emit(all)
    }

    // ------------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------------

    fn apply_created(
        &mut self,
        path: RelativePath,
        is_folder: Option<bool>,
        now: Instant,
    ) -> Vec<ChangeModel> {
        let existing = self.pending.get(&path).cloned();
        let net = match existing.as_ref().map(|p| &p.net) {
            None | Some(Net::Created) => Net::Created,
            Some(Net::Modified) => Net::Modified,
            Some(Net::Renamed { from, .. }) => Net::Renamed {
                from: from.clone(),
                modified: is_folder != Some(true),
            },
            Some(Net::Deleted) => {
                let was_folder = existing.as_ref().and_then(|p| p.is_folder);
                let same_type = match (was_folder, is_folder) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                };
                if !same_type {
                    let displaced = self.pending.remove(&path);
                    self.touch(path.clone(), Net::Created, is_folder, now);
                    return displaced
                        .map(|p| Self::to_changes(&path, &p))
                        .unwrap_or_default();
                }
                if is_folder.or(was_folder) == Some(true) {
                    // The folder is back where it was
                    self.pending.remove(&path);
                    return Vec::new();
                }
                Net::Modified
            }
        };
        self.touch(path, net, is_folder, now);
        Vec::new()
    }

    fn apply_modified(&mut self, path: RelativePath, now: Instant) {
        let net = match self.pending.get(&path).map(|p| &p.net) {
            None | Some(Net::Modified) | Some(Net::Deleted) => Net::Modified,
            Some(Net::Created) => Net::Created,
            Some(Net::Renamed { from, .. }) => Net::Renamed {
                from: from.clone(),
                modified: true,
            },
        };
        self.touch(path, net, Some(false), now);
    }

    fn apply_removed(&mut self, path: RelativePath, is_folder: Option<bool>, now: Instant) {
        self.drop_descendants(&path, now);

        let existing = self.pending.remove(&path);
        let is_folder = is_folder.or(existing.as_ref().and_then(|p| p.is_folder));
        match existing.map(|p| p.net) {
            None | Some(Net::Modified) | Some(Net::Deleted) => {
                self.touch(path, Net::Deleted, is_folder, now);
            }
            Some(Net::Created) => {}
            Some(Net::Renamed { from, .. }) => {
                // The item never reached its new name on the server
                self.merge_deleted(from, is_folder, now);
            }
        }
    }

    /// Record a deletion at a path that may already hold buffered state
    fn merge_deleted(&mut self, path: RelativePath, is_folder: Option<bool>, now: Instant) {
        let net = match self.pending.get(&path).map(|p| &p.net) {
            Some(Net::Created) if is_folder != Some(true) => Net::Modified,
            _ => Net::Deleted,
        };
        self.touch(path, net, is_folder, now);
    }

    fn apply_renamed(
        &mut self,
        from: RelativePath,
        to: RelativePath,
        is_folder: Option<bool>,
        now: Instant,
    ) -> Vec<ChangeModel> {
        if from == to {
            return Vec::new();
        }

        let displaced = match self.pending.remove(&to) {
            Some(p) => {
                debug!(path = %to, "Rename displaces buffered state");
                Self::to_changes(&to, &p)
            }
            None => Vec::new(),
        };

        let source = self.pending.remove(&from);
        let is_folder = is_folder.or(source.as_ref().and_then(|p| p.is_folder));
        let net = match source.map(|p| p.net) {
            None | Some(Net::Deleted) => Some(Net::Renamed {
                from: from.clone(),
                modified: false,
            }),
            Some(Net::Created) => Some(Net::Created),
            Some(Net::Modified) => Some(Net::Renamed {
                from: from.clone(),
                modified: true,
            }),
            Some(Net::Renamed {
                from: origin,
                modified,
            }) => {
                if origin == to {
                    modified.then_some(Net::Modified)
                } else {
                    Some(Net::Renamed {
                        from: origin,
                        modified,
                    })
                }
            }
        };

        if let Some(net) = net {
            self.touch(to.clone(), net, is_folder, now);
        }
        self.rebase_descendants(&from, &to, now);
        displaced
    }

    fn apply_move_in(
        &mut self,
        out: MovedOut,
        to: RelativePath,
        is_folder: Option<bool>,
        now: Instant,
    ) -> Vec<ChangeModel> {
        // Undo the provisional removal, then treat the pair as a rename
        self.pending
            .retain(|p, _| p != &out.path && !p.is_descendant_of(&out.path));
        for (path, pending) in out.prior {
            self.pending.insert(path, pending);
        }
        if out.path == to {
            self.apply_modified(to, now);
            return Vec::new();
        }
        self.apply_renamed(out.path, to, is_folder, now)
    }

    // ------------------------------------------------------------------------
    // Subtree handling
    // ------------------------------------------------------------------------

    fn snapshot_subtree(&self, root: &RelativePath) -> Vec<(RelativePath, Pending)> {
        self.pending
            .iter()
            .filter(|(p, _)| *p == root || p.is_descendant_of(root))
            .map(|(p, pending)| (p.clone(), pending.clone()))
            .collect()
    }

    /// A folder removal makes buffered descendant state moot, except
    /// renames into the folder whose source still exists on the server
    fn drop_descendants(&mut self, folder: &RelativePath, now: Instant) {
        let below: Vec<RelativePath> = self
            .pending
            .keys()
            .filter(|p| p.is_descendant_of(folder))
            .cloned()
            .collect();
        for path in below {
            let Some(pending) = self.pending.remove(&path) else {
                continue;
            };
            if let Net::Renamed { from, .. } = pending.net {
                if from != *folder && !from.is_descendant_of(folder) {
                    self.merge_deleted(from, pending.is_folder, now);
                }
            }
        }
    }

    /// Move buffered state below `from` to below `to`, ordering it after
    /// the folder rename itself
    fn rebase_descendants(&mut self, from: &RelativePath, to: &RelativePath, now: Instant) {
        let below: Vec<RelativePath> = self
            .pending
            .keys()
            .filter(|p| p.is_descendant_of(from))
            .cloned()
            .collect();
        for path in below {
            let (Some(pending), Some(new_path)) = (self.pending.remove(&path), path.rebase(from, to))
            else {
                continue;
            };
            let net = match pending.net {
                Net::Renamed {
                    from: origin,
                    modified,
                } => Net::Renamed {
                    from: origin.rebase(from, to).unwrap_or(origin),
                    modified,
                },
                other => other,
            };
            self.touch(new_path, net, pending.is_folder, now);
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn touch(&mut self, path: RelativePath, net: Net, is_folder: Option<bool>, now: Instant) {
        self.seq += 1;
        let is_folder = is_folder.or(self.pending.get(&path).and_then(|p| p.is_folder));
        self.pending.insert(
            path,
            Pending {
                net,
                is_folder,
                last_event: now,
                seq: self.seq,
            },
        );
    }

    fn relative(&self, path: &Path) -> Option<RelativePath> {
        if self.ignored_dirs.iter().any(|d| path.starts_with(d)) {
            return None;
        }
        let rel = self.root.relativize(path).ok()?;
        let name = rel.file_name();
        if self.ignore_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            trace!(path = %rel, "Ignoring path");
            return None;
        }
        Some(rel)
    }

    fn emit(mut ready: Vec<(RelativePath, Pending)>) -> Vec<ChangeModel> {
        ready.sort_by_key(|(_, p)| p.seq);
        ready
            .iter()
            .flat_map(|(path, pending)| Self::to_changes(path, pending))
            .collect()
    }

    fn to_changes(path: &RelativePath, pending: &Pending) -> Vec<ChangeModel> {
        let is_folder = pending.is_folder.unwrap_or(false);
        match &pending.net {
            Net::Created => vec![ChangeModel::created(Direction::ToServer, path.clone(), is_folder)],
            Net::Modified => vec![ChangeModel::modified(Direction::ToServer, path.clone())],
            Net::Deleted => vec![ChangeModel::deleted(Direction::ToServer, path.clone(), is_folder)],
            Net::Renamed { from, modified } => {
                let mut changes = vec![ChangeModel::renamed(
                    Direction::ToServer,
                    from.clone(),
                    path.clone(),
                    is_folder,
                )];
                if *modified && !is_folder {
                    changes.push(ChangeModel::modified(Direction::ToServer, path.clone()));
                }
                changes
            }
        }
    }
}

// ============================================================================
// Debounce loop
// ============================================================================

/// Drive a [`Debouncer`] from the watcher channel until `cancel` fires
///
/// Coalesced changes are forwarded to `out`. On cancellation (or when the
/// watcher channel closes) queued raw events are drained and everything
/// still buffered is flushed and returned, together with any change the
/// receiver no longer accepted, so the caller can record it.
pub async fn run_debounce_loop(
    mut debouncer: Debouncer,
    mut raw_rx: mpsc::Receiver<RawFsEvent>,
    out: mpsc::Sender<ChangeModel>,
    cancel: CancellationToken,
) -> Vec<ChangeModel> {
    let mut interval = tokio::time::interval((debouncer.quiet() / 4).max(MIN_TICK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut leftover = Vec::new();

    'run: loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            raw = raw_rx.recv() => match raw {
                Some(raw) => {
                    let mut released = debouncer.observe(raw).into_iter();
                    while let Some(change) = released.next() {
                        if let Err(e) = out.send(change).await {
                            leftover.push(e.0);
                            leftover.extend(released);
                            break 'run;
                        }
                    }
                }
                None => {
                    debug!("Raw event channel closed");
                    break;
                }
            },

            _ = interval.tick() => {
                let mut ready = debouncer.poll(Instant::now()).into_iter();
                while let Some(change) = ready.next() {
                    if let Err(e) = out.send(change).await {
                        leftover.push(e.0);
                        leftover.extend(ready);
                        break 'run;
                    }
                }
            }
        }
    }

    while let Ok(raw) = raw_rx.try_recv() {
        leftover.extend(debouncer.observe(raw));
    }
    leftover.extend(debouncer.flush());
    debug!(count = leftover.len(), "Debounce loop stopped");
    leftover
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxsync_core::domain::ChangeKind;

    const QUIET: Duration = Duration::from_millis(500);

    fn debouncer() -> Debouncer {
        Debouncer::new(SyncPath::new(PathBuf::from("/sync")).unwrap(), QUIET)
            .with_ignore_suffixes(vec![".swp".to_string()])
    }

    fn raw(kind: RawKind, path: &str) -> RawFsEvent {
        RawFsEvent::new(kind, format!("/sync/{path}")).folder(false)
    }

    fn renamed(from: &str, to: &str) -> RawFsEvent {
        raw(
            RawKind::Renamed {
                from: PathBuf::from(format!("/sync/{from}")),
            },
            to,
        )
    }

    fn rel(s: &str) -> RelativePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_quiet_window_restarts_on_new_event() {
        let mut d = debouncer();
        let t0 = Instant::now();
        assert!(d.observe_at(raw(RawKind::Created, "a.txt"), t0).is_empty());
        d.observe_at(raw(RawKind::Modified, "a.txt"), t0 + Duration::from_millis(400));

        assert!(d.poll(t0 + Duration::from_millis(600)).is_empty());
        let out = d.poll(t0 + Duration::from_millis(900));
        assert_eq!(
            out,
            vec![ChangeModel::created(Direction::ToServer, rel("a.txt"), false)]
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_create_then_delete_yields_nothing() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Created, "a.txt"), t0);
        d.observe_at(raw(RawKind::Removed, "a.txt"), t0);
        assert!(d.poll(t0 + QUIET).is_empty());
        assert!(d.flush().is_empty());
    }

    #[test]
    fn test_modify_then_delete_is_delete() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Modified, "a.txt"), t0);
        d.observe_at(raw(RawKind::Modified, "a.txt"), t0);
        d.observe_at(raw(RawKind::Removed, "a.txt"), t0);
        let out = d.poll(t0 + QUIET);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Deleted);
        assert_eq!(out[0].old_path, Some(rel("a.txt")));
    }

    #[test]
    fn test_delete_then_create_file_is_modify() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Removed, "a.txt"), t0);
        d.observe_at(raw(RawKind::Created, "a.txt"), t0);
        let out = d.flush();
        assert_eq!(
            out,
            vec![ChangeModel::modified(Direction::ToServer, rel("a.txt"))]
        );
    }

    #[test]
    fn test_delete_then_create_folder_is_nothing() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(
            RawFsEvent::new(RawKind::Removed, "/sync/dir").folder(true),
            t0,
        );
        d.observe_at(
            RawFsEvent::new(RawKind::Created, "/sync/dir").folder(true),
            t0,
        );
        assert!(d.flush().is_empty());
    }

    #[test]
    fn test_rename_chain_collapses() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(renamed("a.txt", "b.txt"), t0);
        d.observe_at(renamed("b.txt", "c.txt"), t0);
        let out = d.flush();
        assert_eq!(
            out,
            vec![ChangeModel::renamed(
                Direction::ToServer,
                rel("a.txt"),
                rel("c.txt"),
                false
            )]
        );
    }

    #[test]
    fn test_rename_back_to_origin_is_nothing() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(renamed("a.txt", "b.txt"), t0);
        d.observe_at(renamed("b.txt", "a.txt"), t0);
        assert!(d.flush().is_empty());
    }

    #[test]
    fn test_create_then_rename_is_create_at_new_path() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Created, "draft.txt"), t0);
        d.observe_at(renamed("draft.txt", "final.txt"), t0);
        assert_eq!(
            d.flush(),
            vec![ChangeModel::created(Direction::ToServer, rel("final.txt"), false)]
        );
    }

    #[test]
    fn test_rename_then_delete_is_delete_of_original() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(renamed("a.txt", "b.txt"), t0);
        d.observe_at(raw(RawKind::Removed, "b.txt"), t0);
        assert_eq!(
            d.flush(),
            vec![ChangeModel::deleted(Direction::ToServer, rel("a.txt"), false)]
        );
    }

    #[test]
    fn test_rename_onto_buffered_path_releases_it() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Modified, "b.txt"), t0);
        let released = d.observe_at(renamed("a.txt", "b.txt"), t0);
        assert_eq!(
            released,
            vec![ChangeModel::modified(Direction::ToServer, rel("b.txt"))]
        );
        assert_eq!(d.pending_count(), 1);
    }

    #[test]
    fn test_displaced_edited_rename_releases_both_changes() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(renamed("a.txt", "b.txt"), t0);
        d.observe_at(raw(RawKind::Modified, "b.txt"), t0);

        let released = d.observe_at(renamed("c.txt", "b.txt"), t0);
        assert_eq!(
            released,
            vec![
                ChangeModel::renamed(Direction::ToServer, rel("a.txt"), rel("b.txt"), false),
                ChangeModel::modified(Direction::ToServer, rel("b.txt")),
            ]
        );
        assert_eq!(d.pending_count(), 1);
    }

    #[test]
    fn test_retyped_path_releases_buffered_deletion() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Modified, "c"), t0);
        d.observe_at(raw(RawKind::Removed, "c"), t0);

        let released = d.observe_at(
            RawFsEvent::new(RawKind::Created, "/sync/c").folder(true),
            t0,
        );
        assert_eq!(
            released,
            vec![ChangeModel::deleted(Direction::ToServer, rel("c"), false)]
        );
        assert_eq!(d.pending_count(), 1);
    }

    #[test]
    fn test_tracked_move_halves_become_rename() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Removed, "a.txt").with_tracker(3), t0);
        d.observe_at(raw(RawKind::Created, "b.txt").with_tracker(3), t0);
        assert_eq!(
            d.flush(),
            vec![ChangeModel::renamed(
                Direction::ToServer,
                rel("a.txt"),
                rel("b.txt"),
                false
            )]
        );
    }

    #[test]
    fn test_move_out_of_root_is_delete() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Removed, "a.txt").with_tracker(9), t0);
        let out = d.poll(t0 + QUIET);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_folder_rename_carries_buffered_children() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Created, "dir/x.txt"), t0);
        d.observe_at(
            RawFsEvent::new(
                RawKind::Renamed {
                    from: PathBuf::from("/sync/dir"),
                },
                "/sync/moved",
            )
            .folder(true),
            t0,
        );
        let out = d.flush();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, ChangeKind::Renamed);
        assert_eq!(
            out[1],
            ChangeModel::created(Direction::ToServer, rel("moved/x.txt"), false)
        );
    }

    #[test]
    fn test_ignored_and_foreign_paths() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Created, ".a.txt.swp"), t0);
        d.observe_at(raw(RawKind::Created, "a.txt.boxsync-partial"), t0);
        d.observe_at(RawFsEvent::new(RawKind::Created, "/elsewhere/a.txt"), t0);
        d.observe_at(RawFsEvent::new(RawKind::Created, "/sync"), t0);
        assert!(d.is_empty());
    }

    #[test]
    fn test_rename_from_ignored_source_is_create() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(renamed("a.txt.swp", "a.txt"), t0);
        assert_eq!(
            d.flush(),
            vec![ChangeModel::created(Direction::ToServer, rel("a.txt"), false)]
        );
    }

    #[test]
    fn test_flush_orders_by_arrival() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.observe_at(raw(RawKind::Created, "b.txt"), t0);
        d.observe_at(raw(RawKind::Created, "a.txt"), t0);
        let paths: Vec<_> = d
            .flush()
            .iter()
            .map(|c| c.primary_path().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["b.txt", "a.txt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_forwards_and_flushes_on_cancel() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_debounce_loop(
            debouncer(),
            raw_rx,
            out_tx,
            cancel.clone(),
        ));

        raw_tx.send(raw(RawKind::Created, "a.txt")).await.unwrap();
        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.primary_path(), Some(&rel("a.txt")));

        raw_tx.send(raw(RawKind::Created, "b.txt")).await.unwrap();
        tokio::task::yield_now().await;
        cancel.cancel();
        let flushed = handle.await.unwrap();
        assert_eq!(
            flushed,
            vec![ChangeModel::created(Direction::ToServer, rel("b.txt"), false)]
        );
    }
}
