//! Per-root index: owns the entries of one configured root, drives its
//! initial scan and applies live monitor events to its own containers.
//!
//! The index keeps folders and files in `(Name, Path)`-ordered containers
//! plus a path→folder map used to resolve monitor events. Raw events queue
//! up on a channel; `process_events` drains them under the index lock and
//! returns a `StartModifying .. EndModifying` bracketed batch of typed
//! [`IndexEvent`]s for the store consumer to apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{ExcludeManager, Include, PropertyFlags};
use crate::container::EntriesContainer;
use crate::context::TaskContextHandle;
use crate::entry::{Entry, EntryKind, propagate_size};
use crate::error::{Error, Result};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorHandle};
use crate::scan::{scan_root, scan_subtree, stat_entry};
use crate::sort::SortKey;

/// Typed change notification produced by a root index.
///
/// Mutation kinds only ever appear between `StartModifying` and
/// `EndModifying`; the consumer holds exactly one store lock for the whole
/// bracket and applies the batch atomically with respect to readers.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    ScanStarted,
    ScanFinished,
    MonitoringStarted,
    MonitoringFinished,
    StartModifying,
    EndModifying,
    EntryCreated {
        folders: Vec<Arc<Entry>>,
        files: Vec<Arc<Entry>>,
    },
    EntryDeleted {
        folders: Vec<Arc<Entry>>,
        files: Vec<Arc<Entry>>,
    },
    EntryRenamed {
        from: Arc<Entry>,
        to: Arc<Entry>,
    },
    EntryMoved {
        from: Arc<Entry>,
        to: Arc<Entry>,
    },
    /// File content was rewritten; the new attributes have not been applied
    /// to the entry yet.
    EntryChanged {
        entry: Arc<Entry>,
        size: u64,
        mtime: i64,
    },
    /// Metadata changed; same contract as [`IndexEvent::EntryChanged`].
    EntryAttributeChanged {
        entry: Arc<Entry>,
        size: u64,
        mtime: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Created,
    Scanning,
    Ready,
    Cancelled,
    Monitoring,
    Stopped,
}

struct IndexInner {
    /// `(Name, Path)`-ordered containers; the root anchor entry is a member
    /// of the folder container and keeps the parent chains alive.
    folders: Option<EntriesContainer>,
    files: Option<EntriesContainer>,
    folders_by_path: HashMap<PathBuf, Arc<Entry>>,
}

pub struct RootIndex {
    id: u32,
    include: Include,
    exclude: ExcludeManager,
    flags: PropertyFlags,
    inner: Mutex<IndexInner>,
    state: Mutex<IndexState>,
    /// Lifecycle notices waiting to ride along with the next batch.
    pending: Mutex<Vec<IndexEvent>>,
    event_tx: Sender<MonitorEvent>,
    event_rx: Mutex<Receiver<MonitorEvent>>,
    monitor_ctx: TaskContextHandle,
    monitoring: AtomicBool,
    initialized: AtomicBool,
}

impl RootIndex {
    pub(crate) fn new(
        id: u32,
        include: Include,
        exclude: ExcludeManager,
        flags: PropertyFlags,
        monitor_ctx: TaskContextHandle,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = channel();
        Arc::new(Self {
            id,
            include,
            exclude,
            flags,
            inner: Mutex::new(IndexInner {
                folders: None,
                files: None,
                folders_by_path: HashMap::new(),
            }),
            state: Mutex::new(IndexState::Created),
            pending: Mutex::new(Vec::new()),
            event_tx,
            event_rx: Mutex::new(event_rx),
            monitor_ctx,
            monitoring: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn get_id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn get_flags(&self) -> PropertyFlags {
        self.flags
    }

    #[must_use]
    pub fn include(&self) -> &Include {
        &self.include
    }

    #[must_use]
    pub fn state(&self) -> IndexState {
        *self.state.lock().expect("index state lock poisoned")
    }

    fn set_state(&self, state: IndexState) {
        *self.state.lock().expect("index state lock poisoned") = state;
    }

    fn push_pending(&self, event: IndexEvent) {
        self.pending
            .lock()
            .expect("index pending lock poisoned")
            .push(event);
    }

    /// Walk the root and build the index containers. Idempotent: a second
    /// call on an initialized index is a no-op.
    pub fn scan(&self, cancel: &CancelToken) -> Result<()> {
        if self.initialized.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        self.set_state(IndexState::Scanning);
        self.push_pending(IndexEvent::ScanStarted);

        let outcome = match scan_root(&self.include, &self.exclude, self.id, cancel) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.set_state(if matches!(error, Error::Cancelled) {
                    IndexState::Cancelled
                } else {
                    IndexState::Stopped
                });
                return Err(error);
            }
        };

        debug!(
            "scanned {}: {} folders, {} files",
            outcome.root.full_path(),
            outcome.folders.len(),
            outcome.files.len()
        );

        let folders = EntriesContainer::from_entries(
            outcome.folders.clone(),
            false,
            SortKey::Name,
            Some(SortKey::Path),
            EntryKind::Folder,
            cancel,
        )?;
        let files = EntriesContainer::from_entries(
            outcome.files,
            false,
            SortKey::Name,
            Some(SortKey::Path),
            EntryKind::File,
            cancel,
        )?;

        let mut by_path = HashMap::with_capacity(outcome.folders.len());
        for folder in &outcome.folders {
            by_path.insert(PathBuf::from(folder.full_path()), Arc::clone(folder));
        }

        let mut inner = self.inner.lock().expect("index lock poisoned");
        inner.folders = Some(folders);
        inner.files = Some(files);
        inner.folders_by_path = by_path;
        drop(inner);

        self.initialized.store(true, AtomicOrdering::Release);
        self.set_state(IndexState::Ready);
        self.push_pending(IndexEvent::ScanFinished);
        Ok(())
    }

    pub fn start_monitoring(&self, start: bool) {
        let was = self.monitoring.swap(start, AtomicOrdering::AcqRel);
        if was == start {
            return;
        }
        if start {
            self.set_state(IndexState::Monitoring);
            self.push_pending(IndexEvent::MonitoringStarted);
        } else {
            self.set_state(IndexState::Ready);
            self.push_pending(IndexEvent::MonitoringFinished);
        }
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(AtomicOrdering::Acquire)
    }

    /// Handle for a monitor backend to deliver raw events for this root.
    #[must_use]
    pub fn monitor_handle(&self) -> MonitorHandle {
        MonitorHandle::new(self.event_tx.clone(), self.monitor_ctx.clone())
    }

    /// Queue a raw event directly, bypassing the monitor context hop.
    pub(crate) fn inject_event(&self, event: MonitorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Entry sets as flat ordered sequences, for the store merge.
    #[must_use]
    pub fn get_files(&self) -> Vec<Arc<Entry>> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner.files.as_ref().map(EntriesContainer::joined).unwrap_or_default()
    }

    #[must_use]
    pub fn get_folders(&self) -> Vec<Arc<Entry>> {
        let inner = self.inner.lock().expect("index lock poisoned");
        inner
            .folders
            .as_ref()
            .map(EntriesContainer::joined)
            .unwrap_or_default()
    }

    /// Drain queued monitor events into a bracketed batch of typed events.
    /// Returns `None` when there is nothing to report. Raw events are only
    /// consumed while the index is monitoring and initialized.
    pub(crate) fn process_events(&self) -> Option<Vec<IndexEvent>> {
        let mut batch: Vec<IndexEvent> = self
            .pending
            .lock()
            .expect("index pending lock poisoned")
            .drain(..)
            .collect();

        if self.is_monitoring() && self.initialized.load(AtomicOrdering::Acquire) {
            let raw: Vec<MonitorEvent> = {
                let event_rx = self.event_rx.lock().expect("index event queue poisoned");
                event_rx.try_iter().collect()
            };
            if !raw.is_empty() {
                let mut inner = self.inner.lock().expect("index lock poisoned");
                let mut mutations = Vec::new();
                for event in raw {
                    // A failed backend flips `monitoring` off mid-drain; the
                    // remaining raw events are moot once the watch is gone.
                    if !self.is_monitoring() {
                        break;
                    }
                    self.process_one(&mut inner, event, &mut mutations);
                }
                if !mutations.is_empty() {
                    batch.push(IndexEvent::StartModifying);
                    batch.append(&mut mutations);
                    batch.push(IndexEvent::EndModifying);
                }
            }
        }

        if batch.is_empty() { None } else { Some(batch) }
    }

    fn process_one(&self, inner: &mut IndexInner, event: MonitorEvent, out: &mut Vec<IndexEvent>) {
        if matches!(event.kind, MonitorEventKind::Failed) {
            warn!("monitor backend failed for root {}", self.id);
            self.monitoring.store(false, AtomicOrdering::Release);
            self.set_state(IndexState::Stopped);
            out.push(IndexEvent::MonitoringFinished);
            return;
        }

        let Some(parent) = inner.folders_by_path.get(&event.parent).cloned() else {
            debug!("watched folder no longer present: {}", event.parent.display());
            return;
        };

        match event.kind.clone() {
            MonitorEventKind::Created => self.process_create(inner, &parent, &event.name, out),
            MonitorEventKind::Deleted => self.process_delete(inner, &parent, &event.name, out),
            MonitorEventKind::Renamed { new_name } => {
                self.process_rename(inner, &parent, &event.name, &new_name, out);
            }
            MonitorEventKind::Moved { to_parent, to_name } => {
                self.process_move(inner, &parent, &event.name, &to_parent, &to_name, out);
            }
            MonitorEventKind::AttributeChanged => {
                self.process_attrib(inner, &parent, &event.name, false, out);
            }
            MonitorEventKind::ContentChanged => {
                self.process_attrib(inner, &parent, &event.name, true, out);
            }
            MonitorEventKind::Failed => unreachable!("handled above"),
        }
    }

    fn child_path(parent: &Arc<Entry>, name: &str) -> PathBuf {
        let mut path = PathBuf::from(parent.full_path());
        path.push(name);
        path
    }

    fn find_file(inner: &IndexInner, parent: &Arc<Entry>, name: &str) -> Option<Arc<Entry>> {
        let probe = Entry::probe(EntryKind::File, name, Arc::clone(parent));
        inner.files.as_ref()?.find(&probe)
    }

    fn find_entry(inner: &IndexInner, parent: &Arc<Entry>, name: &str) -> Option<Arc<Entry>> {
        let path = Self::child_path(parent, name);
        inner
            .folders_by_path
            .get(&path)
            .cloned()
            .or_else(|| Self::find_file(inner, parent, name))
    }

    fn process_create(
        &self,
        inner: &mut IndexInner,
        parent: &Arc<Entry>,
        name: &str,
        out: &mut Vec<IndexEvent>,
    ) {
        if Self::find_entry(inner, parent, name).is_some() {
            // Already indexed; a duplicate create degrades to an attribute
            // refresh, like a moved-onto path would.
            self.process_attrib(inner, parent, name, false, out);
            return;
        }

        let path = Self::child_path(parent, name);
        let Some((size, mtime, is_dir)) = stat_entry(&path) else {
            debug!("created entry vanished before stat: {}", path.display());
            return;
        };

        if is_dir {
            match scan_subtree(&path, Arc::clone(parent), &self.exclude, self.id) {
                Ok((folders, files)) => {
                    for folder in &folders {
                        inner
                            .folders_by_path
                            .insert(PathBuf::from(folder.full_path()), Arc::clone(folder));
                        if let Some(container) = inner.folders.as_ref() {
                            container.insert(Arc::clone(folder));
                        }
                    }
                    for file in &files {
                        if let Some(container) = inner.files.as_ref() {
                            container.insert(Arc::clone(file));
                        }
                    }
                    out.push(IndexEvent::EntryCreated { folders, files });
                }
                Err(error) => debug!("failed to scan new folder {}: {error}", path.display()),
            }
        } else {
            let file = Entry::new_file(name, size, mtime, Arc::clone(parent));
            if let Some(container) = inner.files.as_ref() {
                container.insert(Arc::clone(&file));
            }
            propagate_size(Some(Arc::clone(parent)), size as i64);
            out.push(IndexEvent::EntryCreated {
                folders: Vec::new(),
                files: vec![file],
            });
        }
    }

    fn process_delete(
        &self,
        inner: &mut IndexInner,
        parent: &Arc<Entry>,
        name: &str,
        out: &mut Vec<IndexEvent>,
    ) {
        let path = Self::child_path(parent, name);
        if let Some(folder) = inner.folders_by_path.get(&path).cloned() {
            self.delete_folder(inner, &folder, out);
            return;
        }

        let Some(file) = Self::find_file(inner, parent, name) else {
            debug!("deleted entry was not indexed: {}", path.display());
            return;
        };
        if let Some(container) = inner.files.as_ref() {
            container.steal(&file);
        }
        propagate_size(file.parent(), -(file.size() as i64));
        out.push(IndexEvent::EntryDeleted {
            folders: Vec::new(),
            files: vec![file],
        });
    }

    fn delete_folder(&self, inner: &mut IndexInner, folder: &Arc<Entry>, out: &mut Vec<IndexEvent>) {
        let mut folders = Vec::new();
        if let Some(container) = inner.folders.as_ref() {
            folders = container.steal_descendants(folder, None);
            container.steal(folder);
        }
        folders.insert(0, Arc::clone(folder));

        let files = inner
            .files
            .as_ref()
            .map(|container| container.steal_descendants(folder, None))
            .unwrap_or_default();

        for gone in &folders {
            inner.folders_by_path.remove(&PathBuf::from(gone.full_path()));
        }
        propagate_size(folder.parent(), -(folder.size() as i64));
        out.push(IndexEvent::EntryDeleted { folders, files });
    }

    fn process_rename(
        &self,
        inner: &mut IndexInner,
        parent: &Arc<Entry>,
        old_name: &str,
        new_name: &str,
        out: &mut Vec<IndexEvent>,
    ) {
        let old_path = Self::child_path(parent, old_name);
        if inner.folders_by_path.contains_key(&old_path) {
            // Folder renames change every descendant path; rebuilding the
            // subtree is both simpler and no slower than patching it.
            self.process_delete(inner, parent, old_name, out);
            self.process_create(inner, parent, new_name, out);
            return;
        }

        let Some(from) = Self::find_file(inner, parent, old_name) else {
            self.process_create(inner, parent, new_name, out);
            return;
        };
        if let Some(container) = inner.files.as_ref() {
            container.steal(&from);
        }

        let new_path = Self::child_path(parent, new_name);
        let (size, mtime) = stat_entry(&new_path)
            .map(|(size, mtime, _)| (size, mtime))
            .unwrap_or((from.size(), from.mtime()));
        let to = Entry::new_file(new_name, size, mtime, Arc::clone(parent));
        if let Some(container) = inner.files.as_ref() {
            container.insert(Arc::clone(&to));
        }
        propagate_size(Some(Arc::clone(parent)), size as i64 - from.size() as i64);
        out.push(IndexEvent::EntryRenamed { from, to });
    }

    fn process_move(
        &self,
        inner: &mut IndexInner,
        from_parent: &Arc<Entry>,
        from_name: &str,
        to_parent_path: &Path,
        to_name: &str,
        out: &mut Vec<IndexEvent>,
    ) {
        let Some(to_parent) = inner.folders_by_path.get(to_parent_path).cloned() else {
            // Destination is outside the indexed tree; from our point of
            // view the entry is gone.
            self.process_delete(inner, from_parent, from_name, out);
            return;
        };

        let old_path = Self::child_path(from_parent, from_name);
        if inner.folders_by_path.contains_key(&old_path) {
            self.process_delete(inner, from_parent, from_name, out);
            let to_parent_entry = to_parent;
            let name = to_name.to_string();
            // Re-scan at the destination.
            let mut created = Vec::new();
            self.process_create(inner, &to_parent_entry, &name, &mut created);
            out.append(&mut created);
            return;
        }

        let Some(from) = Self::find_file(inner, from_parent, from_name) else {
            self.process_create(inner, &to_parent, to_name, out);
            return;
        };
        if let Some(container) = inner.files.as_ref() {
            container.steal(&from);
        }

        let new_path = {
            let mut path = to_parent_path.to_path_buf();
            path.push(to_name);
            path
        };
        let (size, mtime) = stat_entry(&new_path)
            .map(|(size, mtime, _)| (size, mtime))
            .unwrap_or((from.size(), from.mtime()));
        let to = Entry::new_file(to_name, size, mtime, Arc::clone(&to_parent));
        if let Some(container) = inner.files.as_ref() {
            container.insert(Arc::clone(&to));
        }
        propagate_size(from.parent(), -(from.size() as i64));
        propagate_size(Some(to_parent), size as i64);
        out.push(IndexEvent::EntryMoved { from, to });
    }

    fn process_attrib(
        &self,
        inner: &mut IndexInner,
        parent: &Arc<Entry>,
        name: &str,
        content_changed: bool,
        out: &mut Vec<IndexEvent>,
    ) {
        let Some(entry) = Self::find_entry(inner, parent, name) else {
            debug!("attribute event for unindexed entry {name:?}");
            return;
        };
        let path = Self::child_path(parent, name);
        let Some((stat_size, mtime, _)) = stat_entry(&path) else {
            return;
        };
        // A folder's size is the recursive sum of its children, never the
        // raw directory size the filesystem reports.
        let size = if entry.is_folder() {
            entry.size()
        } else {
            stat_size
        };
        if size == entry.size() && mtime == entry.mtime() {
            return;
        }
        // The entry keeps its old attributes until the consumer has stolen
        // it from the attribute-sorted containers; mutating here would
        // invalidate their search keys.
        if content_changed {
            out.push(IndexEvent::EntryChanged { entry, size, mtime });
        } else {
            out.push(IndexEvent::EntryAttributeChanged { entry, size, mtime });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        _ctx: TaskContext,
        index: Arc<RootIndex>,
        root_path: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaaa").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/b.txt"), b"bb").unwrap();

        let ctx = TaskContext::new("test-monitor");
        let include = Include::new(dir.path(), 7).with_monitor(true);
        let index = RootIndex::new(
            7,
            include,
            ExcludeManager::new(),
            PropertyFlags::default(),
            ctx.handle(),
        );
        index.scan(&CancelToken::new()).unwrap();
        index.start_monitoring(true);
        // Flush lifecycle notices so tests see only mutation batches.
        let _ = index.process_events();

        let root_path = dir.path().to_path_buf();
        Fixture {
            _dir: dir,
            _ctx: ctx,
            index,
            root_path,
        }
    }

    #[test]
    fn scan_builds_both_containers() {
        let fx = fixture();
        assert_eq!(fx.index.state(), IndexState::Monitoring);
        assert_eq!(fx.index.get_folders().len(), 2); // root + d
        assert_eq!(fx.index.get_files().len(), 2);
    }

    #[test]
    fn create_event_adds_a_file_and_brackets_the_batch() {
        let fx = fixture();
        fs::write(fx.root_path.join("c.txt"), b"cc").unwrap();
        fx.index.inject_event(MonitorEvent::new(
            MonitorEventKind::Created,
            &fx.root_path,
            "c.txt",
        ));

        let batch = fx.index.process_events().unwrap();
        assert!(matches!(batch.first(), Some(IndexEvent::StartModifying)));
        assert!(matches!(batch.last(), Some(IndexEvent::EndModifying)));
        assert!(batch.iter().any(|e| matches!(
            e,
            IndexEvent::EntryCreated { files, .. } if files.len() == 1 && files[0].name() == "c.txt"
        )));
        assert_eq!(fx.index.get_files().len(), 3);
    }

    #[test]
    fn delete_event_removes_a_subtree() {
        let fx = fixture();
        fs::remove_file(fx.root_path.join("d/b.txt")).unwrap();
        fs::remove_dir(fx.root_path.join("d")).unwrap();
        fx.index.inject_event(
            MonitorEvent::new(MonitorEventKind::Deleted, &fx.root_path, "d").directory(),
        );

        let batch = fx.index.process_events().unwrap();
        assert!(batch.iter().any(|e| matches!(
            e,
            IndexEvent::EntryDeleted { folders, files }
                if folders.len() == 1 && files.len() == 1
        )));
        assert_eq!(fx.index.get_folders().len(), 1);
        assert_eq!(fx.index.get_files().len(), 1);
    }

    #[test]
    fn rename_event_replaces_the_file_entry() {
        let fx = fixture();
        fs::rename(fx.root_path.join("a.txt"), fx.root_path.join("z.txt")).unwrap();
        fx.index.inject_event(MonitorEvent::new(
            MonitorEventKind::Renamed {
                new_name: "z.txt".into(),
            },
            &fx.root_path,
            "a.txt",
        ));

        let batch = fx.index.process_events().unwrap();
        assert!(batch.iter().any(|e| matches!(
            e,
            IndexEvent::EntryRenamed { from, to }
                if from.name() == "a.txt" && to.name() == "z.txt"
        )));
    }

    #[test]
    fn events_are_ignored_while_not_monitoring() {
        let fx = fixture();
        fx.index.start_monitoring(false);
        let _ = fx.index.process_events(); // drop the MonitoringFinished notice
        fs::write(fx.root_path.join("c.txt"), b"cc").unwrap();
        fx.index.inject_event(MonitorEvent::new(
            MonitorEventKind::Created,
            &fx.root_path,
            "c.txt",
        ));
        assert!(fx.index.process_events().is_none());
        assert_eq!(fx.index.get_files().len(), 2);
    }

    #[test]
    fn monitor_failure_stops_the_index() {
        let fx = fixture();
        fx.index.inject_event(MonitorEvent::failed());
        let batch = fx.index.process_events().unwrap();
        assert!(batch
            .iter()
            .any(|e| matches!(e, IndexEvent::MonitoringFinished)));
        assert_eq!(fx.index.state(), IndexState::Stopped);
        assert!(!fx.index.is_monitoring());
    }
}
