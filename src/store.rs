//! Index store: the union of all per-root indices, maintained as one pair of
//! sorted containers per supported sort key.
//!
//! The store owns two background contexts. The worker context periodically
//! drains every member index's monitor queue and forwards the resulting
//! batches to the work queue; the monitor context hosts event delivery from
//! monitor backends. Structural mutation (start, add, remove) is serialized
//! by the work-queue thread, which owns the store behind the engine mutex.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{ExcludeManager, IncludeManager, PropertyFlags};
use crate::container::EntriesContainer;
use crate::context::{TaskContext, TaskContextHandle};
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::index::RootIndex;
use crate::snapshot::SnapshotData;
use crate::sort::{NUM_SORT_KEYS, SortKey};
use crate::work::Work;

const MONITOR_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

type ContainerSlots = [Option<Arc<EntriesContainer>>; NUM_SORT_KEYS];

pub struct IndexStore {
    indices: Vec<Arc<RootIndex>>,
    folder_containers: ContainerSlots,
    file_containers: ContainerSlots,
    includes: IncludeManager,
    excludes: ExcludeManager,
    flags: PropertyFlags,
    is_sorted: bool,
    running: bool,
    /// Indices the worker tick drains; weak so a swapped-out store's pump
    /// cannot keep indices alive.
    registry: Arc<Mutex<Vec<Weak<RootIndex>>>>,
    monitor_ctx: TaskContextHandle,
    _worker: TaskContext,
    _monitor: TaskContext,
}

impl IndexStore {
    pub(crate) fn new(
        includes: IncludeManager,
        excludes: ExcludeManager,
        flags: PropertyFlags,
        work_tx: Sender<Work>,
    ) -> Self {
        let registry: Arc<Mutex<Vec<Weak<RootIndex>>>> = Arc::default();
        let monitor = TaskContext::new("fsdb-monitor");

        let tick_registry = Arc::clone(&registry);
        let worker = TaskContext::with_tick(
            "fsdb-worker",
            MONITOR_DRAIN_INTERVAL,
            Box::new(move || {
                let mut indices = Vec::new();
                {
                    let mut registry = tick_registry.lock().expect("registry lock poisoned");
                    registry.retain(|weak| {
                        if let Some(index) = weak.upgrade() {
                            indices.push(index);
                            true
                        } else {
                            false
                        }
                    });
                }
                for index in indices {
                    if let Some(events) = index.process_events() {
                        let _ = work_tx.send(Work::MonitorBatch {
                            index_id: index.get_id(),
                            events,
                        });
                    }
                }
            }),
        );

        Self {
            indices: Vec::new(),
            folder_containers: Default::default(),
            file_containers: Default::default(),
            includes,
            excludes,
            flags,
            is_sorted: false,
            running: false,
            registry,
            monitor_ctx: monitor.handle(),
            _worker: worker,
            _monitor: monitor,
        }
    }

    /// Rebuild a store from decoded snapshot state. The loaded store has no
    /// member indices, so it serves queries but cannot monitor.
    pub(crate) fn from_snapshot(
        data: SnapshotData,
        includes: IncludeManager,
        excludes: ExcludeManager,
        work_tx: Sender<Work>,
    ) -> Result<Self> {
        let mut store = Self::new(includes, excludes, data.flags, work_tx);
        let noop = CancelToken::new();
        for key in SortKey::ALL {
            let slot = key.as_u32() as usize;
            if let Some(folders) = data.folders[slot].clone() {
                store.folder_containers[slot] = Some(Arc::new(EntriesContainer::from_entries(
                    folders,
                    true,
                    key,
                    None,
                    EntryKind::Folder,
                    &noop,
                )?));
            }
            if let Some(files) = data.files[slot].clone() {
                store.file_containers[slot] = Some(Arc::new(EntriesContainer::from_entries(
                    files,
                    true,
                    key,
                    None,
                    EntryKind::File,
                    &noop,
                )?));
            }
        }
        store.is_sorted = true;
        Ok(store)
    }

    /// Scan every eligible include into a per-root index and build the full
    /// set of sort containers. Cancellation discards all partial state and
    /// leaves the store empty with `running = false`.
    pub(crate) fn start(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.running {
            return Ok(());
        }

        let mut new_indices = Vec::new();
        for include in self.includes.get_includes() {
            let already_present = self
                .indices
                .iter()
                .chain(new_indices.iter())
                .any(|index: &Arc<RootIndex>| index.get_id() == include.get_id());
            if already_present {
                continue;
            }

            let index = RootIndex::new(
                include.get_id(),
                include.clone(),
                self.excludes.clone(),
                self.flags,
                self.monitor_ctx.clone(),
            );
            if !index.get_flags().contains(self.flags) {
                continue;
            }
            match index.scan(cancel) {
                Ok(()) => new_indices.push(index),
                Err(Error::Cancelled) => {
                    self.discard();
                    return Err(Error::Cancelled);
                }
                Err(error) => {
                    warn!(
                        "failed to scan {}: {error}",
                        include.get_path().display()
                    );
                }
            }
        }

        let mut all_folders: Vec<Arc<Entry>> = Vec::new();
        let mut all_files: Vec<Arc<Entry>> = Vec::new();
        for index in &new_indices {
            all_folders.extend(index.get_folders());
            all_files.extend(index.get_files());
        }
        self.indices.append(&mut new_indices);

        for key in SortKey::ALL {
            if cancel.is_cancelled() {
                self.discard();
                return Err(Error::Cancelled);
            }
            let slot = key.as_u32() as usize;
            let folders = EntriesContainer::from_entries(
                all_folders.clone(),
                false,
                key,
                None,
                EntryKind::Folder,
                cancel,
            );
            let files = EntriesContainer::from_entries(
                all_files.clone(),
                false,
                key,
                None,
                EntryKind::File,
                cancel,
            );
            match (folders, files) {
                (Ok(folders), Ok(files)) => {
                    self.folder_containers[slot] = Some(Arc::new(folders));
                    self.file_containers[slot] = Some(Arc::new(files));
                }
                _ => {
                    self.discard();
                    return Err(Error::Cancelled);
                }
            }
        }

        self.is_sorted = true;
        self.running = true;

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.clear();
        registry.extend(self.indices.iter().map(Arc::downgrade));

        Ok(())
    }

    fn discard(&mut self) {
        self.indices.clear();
        self.folder_containers = Default::default();
        self.file_containers = Default::default();
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .clear();
        self.is_sorted = false;
        self.running = false;
    }

    /// Enable filesystem monitoring on every member index configured for it.
    pub(crate) fn start_monitoring(&self) {
        for index in &self.indices {
            if index.include().get_monitored() {
                index.start_monitoring(true);
            }
        }
    }

    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn flags(&self) -> PropertyFlags {
        self.flags
    }

    #[must_use]
    pub fn includes(&self) -> &IncludeManager {
        &self.includes
    }

    #[must_use]
    pub fn excludes(&self) -> &ExcludeManager {
        &self.excludes
    }

    #[must_use]
    pub fn num_files(&self) -> u32 {
        self.file_containers[SortKey::Name.as_u32() as usize]
            .as_ref()
            .map_or(0, |c| c.num_entries() as u32)
    }

    #[must_use]
    pub fn num_folders(&self) -> u32 {
        self.folder_containers[SortKey::Name.as_u32() as usize]
            .as_ref()
            .map_or(0, |c| c.num_entries() as u32)
    }

    /// Number of sort keys for which both a file and a folder container are
    /// maintained.
    #[must_use]
    pub fn num_fast_sort_indices(&self) -> u32 {
        (0..NUM_SORT_KEYS)
            .filter(|&slot| {
                self.folder_containers[slot].is_some() && self.file_containers[slot].is_some()
            })
            .count() as u32
    }

    /// Handle to the file container for `key`, or `None` when the store has
    /// not finished sorting or does not maintain the key. The handle keeps
    /// the container alive independently of the store.
    #[must_use]
    pub fn get_files(&self, key: SortKey) -> Option<Arc<EntriesContainer>> {
        if !self.is_sorted {
            return None;
        }
        self.file_containers[key.as_u32() as usize].clone()
    }

    #[must_use]
    pub fn get_folders(&self, key: SortKey) -> Option<Arc<EntriesContainer>> {
        if !self.is_sorted {
            return None;
        }
        self.folder_containers[key.as_u32() as usize].clone()
    }

    /// Identity check used by search views to avoid aliasing a container the
    /// store already mutates.
    #[must_use]
    pub fn has_container(&self, container: &Arc<EntriesContainer>) -> bool {
        self.folder_containers
            .iter()
            .chain(self.file_containers.iter())
            .flatten()
            .any(|c| Arc::ptr_eq(c, container))
    }

    #[must_use]
    pub(crate) fn index_by_id(&self, id: u32) -> Option<Arc<RootIndex>> {
        self.indices
            .iter()
            .find(|index| index.get_id() == id)
            .cloned()
    }

    fn assert_member(&self, index: &Arc<RootIndex>) {
        assert!(
            self.indices.iter().any(|i| Arc::ptr_eq(i, index)),
            "index {} is not a member of this store",
            index.get_id()
        );
    }

    fn containers_for(&self, kind: EntryKind) -> &ContainerSlots {
        match kind {
            EntryKind::Folder => &self.folder_containers,
            EntryKind::File => &self.file_containers,
        }
    }

    /// Steal `entry` from every maintained container of its type.
    pub(crate) fn remove_entry(&self, entry: &Arc<Entry>, index: &Arc<RootIndex>) {
        self.assert_member(index);
        for container in self.containers_for(entry.kind()).iter().flatten() {
            if !container.steal(entry) {
                debug!("store did not hold entry {:?}", entry.name());
            }
        }
    }

    pub(crate) fn remove_folders(&self, folders: &[Arc<Entry>], index: &Arc<RootIndex>) {
        self.assert_member(index);
        for container in self.folder_containers.iter().flatten() {
            for entry in folders {
                if !container.steal(entry) {
                    debug!("store did not hold folder {:?}", entry.name());
                }
            }
        }
    }

    pub(crate) fn remove_files(&self, files: &[Arc<Entry>], index: &Arc<RootIndex>) {
        self.assert_member(index);
        for container in self.file_containers.iter().flatten() {
            for entry in files {
                if !container.steal(entry) {
                    debug!("store did not hold file {:?}", entry.name());
                }
            }
        }
    }

    /// Insert entries into every maintained container of the given type.
    pub(crate) fn add_entries(&self, entries: &[Arc<Entry>], is_folder: bool) {
        let kind = if is_folder {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        for container in self.containers_for(kind).iter().flatten() {
            for entry in entries {
                debug_assert_eq!(entry.kind(), kind);
                container.insert(Arc::clone(entry));
            }
        }
    }

    /// Drop a member index (monitor failure path), stealing everything it
    /// owns from the store containers. Returns the removed entries so views
    /// can be reconciled.
    pub(crate) fn remove_index(&mut self, id: u32) -> Option<(Vec<Arc<Entry>>, Vec<Arc<Entry>>)> {
        let position = self.indices.iter().position(|index| index.get_id() == id)?;
        let index = self.indices.remove(position);
        index.start_monitoring(false);

        let folders = index.get_folders();
        let files = index.get_files();
        for container in self.folder_containers.iter().flatten() {
            for entry in &folders {
                container.steal(entry);
            }
        }
        for container in self.file_containers.iter().flatten() {
            for entry in &files {
                container.steal(entry);
            }
        }

        self.registry
            .lock()
            .expect("registry lock poisoned")
            .retain(|weak| weak.upgrade().is_some_and(|i| !Arc::ptr_eq(&i, &index)));

        Some((folders, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Include;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc::channel;

    fn store_over(dir: &Path, monitored: bool) -> (IndexStore, std::sync::mpsc::Receiver<Work>) {
        let mut includes = IncludeManager::new();
        includes.add(Include::new(dir, 1).with_monitor(monitored));
        let (work_tx, work_rx) = channel();
        let store = IndexStore::new(
            includes,
            ExcludeManager::new(),
            PropertyFlags::default(),
            work_tx,
        );
        (store, work_rx)
    }

    #[test]
    fn start_builds_every_sort_container_for_both_types() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let (mut store, _work_rx) = store_over(dir.path(), false);
        store.start(&CancelToken::new()).unwrap();

        assert!(store.is_running());
        assert_eq!(store.num_fast_sort_indices() as usize, NUM_SORT_KEYS);
        assert_eq!(store.num_files(), 1);
        assert_eq!(store.num_folders(), 2); // root + d
        for key in SortKey::ALL {
            assert!(store.get_files(key).is_some());
            assert!(store.get_folders(key).is_some());
        }
    }

    #[test]
    fn cancelled_start_leaves_the_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let (mut store, _work_rx) = store_over(dir.path(), false);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(store.start(&cancel), Err(Error::Cancelled)));
        assert!(!store.is_running());
        assert!(!store.is_sorted());
        assert_eq!(store.num_files(), 0);
        assert!(store.get_files(SortKey::Name).is_none());
    }

    #[test]
    fn second_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let (mut store, _work_rx) = store_over(dir.path(), false);
        store.start(&CancelToken::new()).unwrap();
        let files_before = store.get_files(SortKey::Name).unwrap();
        store.start(&CancelToken::new()).unwrap();
        let files_after = store.get_files(SortKey::Name).unwrap();
        assert!(Arc::ptr_eq(&files_before, &files_after));
    }

    #[test]
    fn container_handles_outlive_identity_checks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let (mut store, _work_rx) = store_over(dir.path(), false);
        store.start(&CancelToken::new()).unwrap();

        let handle = store.get_files(SortKey::Size).unwrap();
        assert!(store.has_container(&handle));

        let foreign = Arc::new(
            EntriesContainer::from_entries(
                Vec::new(),
                true,
                SortKey::Name,
                None,
                EntryKind::File,
                &CancelToken::new(),
            )
            .unwrap(),
        );
        assert!(!store.has_container(&foreign));
    }

    #[test]
    fn removing_an_index_empties_its_entries_from_all_containers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let (mut store, _work_rx) = store_over(dir.path(), false);
        store.start(&CancelToken::new()).unwrap();
        assert_eq!(store.num_files(), 1);

        let (folders, files) = store.remove_index(1).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(files.len(), 1);
        assert_eq!(store.num_files(), 0);
        assert_eq!(store.num_folders(), 0);
        assert!(store.index_by_id(1).is_none());
    }
}
