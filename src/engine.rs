//! The work-queue orchestrator.
//!
//! A single background thread drains typed work items in enqueue order and
//! owns every structural mutation of the store and the views. Callers reach
//! state through the queue, or through the three non-blocking `try_get_*`
//! readers, which fail with [`Error::Busy`] instead of waiting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::app_dirs;
use crate::cancel::CancelToken;
use crate::config::{ExcludeManager, IncludeManager, PropertyFlags};
use crate::entry::{Entry, propagate_size};
use crate::error::{Error, Result};
use crate::events::DatabaseEvent;
use crate::index::IndexEvent;
use crate::info::{DatabaseInfo, EntryInfo, EntryInfoFlags, SearchInfo};
use crate::monitor::MonitorHandle;
use crate::query::Query;
use crate::search::evaluate_query;
use crate::snapshot;
use crate::sort::{self, SortDirection, SortKey};
use crate::store::IndexStore;
use crate::thread_pool::ThreadPool;
use crate::view::{SearchView, SelectionChange};
use crate::work::Work;

struct EngineState {
    file: PathBuf,
    store: Option<IndexStore>,
    views: HashMap<u32, SearchView>,
    includes: IncludeManager,
    excludes: ExcludeManager,
    flags: PropertyFlags,
    pool: Arc<ThreadPool>,
}

/// The index-and-query engine.
///
/// Dropping the database stops the work queue; queued items that have not
/// run yet are discarded.
pub struct Database {
    work_tx: Sender<Work>,
    state: Arc<Mutex<EngineState>>,
    worker: Option<JoinHandle<()>>,
}

impl Database {
    /// Create an engine persisting to `file` and return it together with the
    /// ordered event stream. A load of the snapshot is queued immediately,
    /// so the engine reaches a usable (possibly empty) state on its own.
    #[must_use]
    pub fn new(file: PathBuf) -> (Self, Receiver<DatabaseEvent>) {
        let (work_tx, work_rx) = channel();
        let (event_tx, event_rx) = channel();

        let state = Arc::new(Mutex::new(EngineState {
            file,
            store: None,
            views: HashMap::new(),
            includes: IncludeManager::new(),
            excludes: ExcludeManager::with_defaults(),
            flags: PropertyFlags::default(),
            pool: Arc::new(ThreadPool::with_default_size()),
        }));

        let handler = Handler {
            state: Arc::clone(&state),
            work_tx: work_tx.clone(),
            event_tx,
        };
        let worker = thread::Builder::new()
            .name("fsdb-work-queue".into())
            .spawn(move || handler.run(work_rx))
            .expect("failed to spawn work queue thread");

        let database = Self {
            work_tx,
            state,
            worker: Some(worker),
        };
        database.queue_load();
        (database, event_rx)
    }

    /// Like [`Database::new`] with the conventional snapshot location.
    pub fn with_default_file() -> Result<(Self, Receiver<DatabaseEvent>)> {
        let file = app_dirs::default_database_file()
            .map_err(|error| Error::Io(std::io::Error::other(error.to_string())))?;
        Ok(Self::new(file))
    }

    fn queue(&self, work: Work) {
        let _ = self.work_tx.send(work);
    }

    pub fn queue_load(&self) -> CancelToken {
        let cancel = CancelToken::new();
        self.queue(Work::Load {
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn queue_save(&self) {
        self.queue(Work::Save);
    }

    pub fn queue_scan(
        &self,
        includes: IncludeManager,
        excludes: ExcludeManager,
        flags: PropertyFlags,
    ) -> CancelToken {
        let cancel = CancelToken::new();
        self.queue(Work::Scan {
            includes,
            excludes,
            flags,
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn queue_rescan(&self) -> CancelToken {
        let cancel = CancelToken::new();
        self.queue(Work::Rescan {
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn queue_search(
        &self,
        view_id: u32,
        query: Arc<dyn Query>,
        sort_order: SortKey,
        direction: SortDirection,
    ) -> CancelToken {
        let cancel = CancelToken::new();
        self.queue(Work::Search {
            view_id,
            query,
            sort_order,
            direction,
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn queue_sort(
        &self,
        view_id: u32,
        sort_order: SortKey,
        direction: SortDirection,
    ) -> CancelToken {
        let cancel = CancelToken::new();
        self.queue(Work::Sort {
            view_id,
            sort_order,
            direction,
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn queue_modify_selection(&self, view_id: u32, change: SelectionChange) {
        self.queue(Work::ModifySelection { view_id, change });
    }

    pub fn queue_item_info(&self, view_id: u32, idx: u32, flags: EntryInfoFlags) {
        self.queue(Work::GetItemInfo {
            view_id,
            idx,
            flags,
        });
    }

    /// Non-blocking read of a view's summary.
    pub fn try_get_search_info(&self, view_id: u32) -> Result<SearchInfo> {
        let state = self.state.try_lock().map_err(|_| Error::Busy)?;
        state
            .views
            .get(&view_id)
            .map(SearchView::search_info)
            .ok_or(Error::UnknownSearchView(view_id))
    }

    /// Non-blocking read of one result entry.
    pub fn try_get_item_info(
        &self,
        view_id: u32,
        idx: u32,
        flags: EntryInfoFlags,
    ) -> Result<EntryInfo> {
        let state = self.state.try_lock().map_err(|_| Error::Busy)?;
        entry_info_in(&state, view_id, idx, flags)
    }

    /// Non-blocking read of the store summary.
    pub fn try_get_database_info(&self) -> Result<DatabaseInfo> {
        let state = self.state.try_lock().map_err(|_| Error::Busy)?;
        Ok(database_info(&state))
    }

    /// Obtain the monitor intake for a root index, for wiring a filesystem
    /// monitor backend.
    #[must_use]
    pub fn monitor_handle(&self, index_id: u32) -> Option<MonitorHandle> {
        let state = self.state.lock().expect("engine state lock poisoned");
        state
            .store
            .as_ref()
            .and_then(|store| store.index_by_id(index_id))
            .map(|index| index.monitor_handle())
    }

    #[cfg(test)]
    fn lock_state_for_tests(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state lock poisoned")
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.work_tx.send(Work::Quit);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn database_info(state: &EngineState) -> DatabaseInfo {
    let (num_files, num_folders) = state
        .store
        .as_ref()
        .map_or((0, 0), |store| (store.num_files(), store.num_folders()));
    DatabaseInfo::new(
        state.includes.clone(),
        state.excludes.clone(),
        num_files,
        num_folders,
    )
}

fn entry_info_in(
    state: &EngineState,
    view_id: u32,
    idx: u32,
    flags: EntryInfoFlags,
) -> Result<EntryInfo> {
    let view = state
        .views
        .get(&view_id)
        .ok_or(Error::UnknownSearchView(view_id))?;
    let entry = view.get_entry(idx).ok_or(Error::EntryNotFound(idx))?;
    let selected = view.is_selected(&entry);
    Ok(EntryInfo::from_entry(&entry, idx, selected, flags))
}

struct Handler {
    state: Arc<Mutex<EngineState>>,
    work_tx: Sender<Work>,
    event_tx: Sender<DatabaseEvent>,
}

impl Handler {
    fn run(&self, work_rx: Receiver<Work>) {
        debug!("work queue thread started");
        while let Ok(work) = work_rx.recv() {
            if !self.handle(work) {
                break;
            }
        }
        debug!("work queue thread returning");
    }

    /// Posting is non-blocking; delivery to the embedder is asynchronous and
    /// preserves post order.
    fn emit(&self, event: DatabaseEvent) {
        let _ = self.event_tx.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state lock poisoned")
    }

    fn handle(&self, work: Work) -> bool {
        match work {
            Work::Load { cancel } => self.load(&cancel),
            Work::Save => self.save(),
            Work::Scan {
                includes,
                excludes,
                flags,
                cancel,
            } => self.scan(includes, excludes, flags, &cancel),
            Work::Rescan { cancel } => self.rescan(&cancel),
            Work::Search {
                view_id,
                query,
                sort_order,
                direction,
                cancel,
            } => self.search(view_id, query, sort_order, direction, &cancel),
            Work::Sort {
                view_id,
                sort_order,
                direction,
                cancel,
            } => self.sort(view_id, sort_order, direction, &cancel),
            Work::ModifySelection { view_id, change } => self.modify_selection(view_id, change),
            Work::GetItemInfo {
                view_id,
                idx,
                flags,
            } => self.item_info(view_id, idx, flags),
            Work::MonitorBatch { index_id, events } => self.monitor_batch(index_id, events),
            Work::Quit => return false,
        }
        true
    }

    fn load(&self, cancel: &CancelToken) {
        self.emit(DatabaseEvent::LoadStarted);

        let file = self.lock().file.clone();
        let decoded = snapshot::load(&file);

        let mut state = self.lock();
        let installed = match decoded {
            Ok(data) if !cancel.is_cancelled() => IndexStore::from_snapshot(
                data,
                state.includes.clone(),
                state.excludes.clone(),
                self.work_tx.clone(),
            ),
            Ok(_) => Err(Error::Cancelled),
            Err(error) => Err(error),
        };
        match installed {
            Ok(store) => {
                state.flags = store.flags();
                state.store = Some(store);
            }
            Err(error) => {
                warn!("failed to load database from {}: {error}", file.display());
                state.includes = IncludeManager::new();
                state.excludes = ExcludeManager::with_defaults();
                state.store = Some(IndexStore::new(
                    state.includes.clone(),
                    state.excludes.clone(),
                    state.flags,
                    self.work_tx.clone(),
                ));
            }
        }
        state.views.clear();
        let info = database_info(&state);
        drop(state);
        self.emit(DatabaseEvent::LoadFinished(info));
    }

    fn save(&self) {
        self.emit(DatabaseEvent::SaveStarted);
        let state = self.lock();
        if let Some(store) = &state.store {
            if let Err(error) = snapshot::save(store, &state.file) {
                warn!("failed to save database to {}: {error}", state.file.display());
            }
        }
        drop(state);
        self.emit(DatabaseEvent::SaveFinished);
    }

    fn scan(
        &self,
        includes: IncludeManager,
        excludes: ExcludeManager,
        flags: PropertyFlags,
        cancel: &CancelToken,
    ) {
        {
            let state = self.lock();
            let unchanged = state.store.as_ref().is_some_and(IndexStore::is_running)
                && state.includes == includes
                && state.excludes == excludes
                && state.flags == flags;
            if unchanged {
                debug!("scan requested with unchanged configuration, nothing to do");
                return;
            }
        }
        self.rebuild(includes, excludes, flags, cancel);
    }

    fn rescan(&self, cancel: &CancelToken) {
        let (includes, excludes, flags) = {
            let state = self.lock();
            (
                state.includes.clone(),
                state.excludes.clone(),
                state.flags,
            )
        };
        self.rebuild(includes, excludes, flags, cancel);
    }

    /// Build a fresh store for the configuration and swap it in. The old
    /// store and all views are dropped only on success; a cancelled or
    /// failed rebuild leaves current state untouched.
    fn rebuild(
        &self,
        includes: IncludeManager,
        excludes: ExcludeManager,
        flags: PropertyFlags,
        cancel: &CancelToken,
    ) {
        self.emit(DatabaseEvent::ScanStarted);

        let mut store = IndexStore::new(
            includes.clone(),
            excludes.clone(),
            flags,
            self.work_tx.clone(),
        );
        let result = store.start(cancel);

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.store = Some(store);
                state.includes = includes;
                state.excludes = excludes;
                state.flags = flags;
                state.views.clear();
                if let Some(store) = &state.store {
                    store.start_monitoring();
                }
            }
            Err(error) => {
                debug!("scan did not complete: {error}");
            }
        }
        let info = database_info(&state);
        drop(state);
        self.emit(DatabaseEvent::ScanFinished(info));
    }

    fn search(
        &self,
        view_id: u32,
        query: Arc<dyn Query>,
        sort_order: SortKey,
        direction: SortDirection,
        cancel: &CancelToken,
    ) {
        let mut state = self.lock();
        if state.store.is_none() {
            return;
        }
        self.emit(DatabaseEvent::SearchStarted { view_id });

        let store = state.store.as_ref().expect("store presence checked above");
        let (folders, files, effective_order) =
            match (store.get_folders(sort_order), store.get_files(sort_order)) {
                (Some(folders), Some(files)) => (folders, files, sort_order),
                _ => match (
                    store.get_folders(SortKey::Name),
                    store.get_files(SortKey::Name),
                ) {
                    (Some(folders), Some(files)) => (folders, files, SortKey::Name),
                    _ => {
                        // Empty store (e.g. after a failed load): register an
                        // empty result set.
                        let info = self.install_view(
                            &mut state,
                            view_id,
                            query,
                            Vec::new(),
                            Vec::new(),
                            sort_order,
                            direction,
                        );
                        drop(state);
                        if let Some(info) = info {
                            self.emit(DatabaseEvent::SearchFinished { view_id, info });
                        }
                        return;
                    }
                },
            };

        let pool = Arc::clone(&state.pool);
        let folder_results = evaluate_query(&query, folders.joined(), &pool, cancel);
        let file_results = evaluate_query(&query, files.joined(), &pool, cancel);
        let (folder_results, file_results) = match (folder_results, file_results) {
            (Ok(folders), Ok(files)) => (folders, files),
            _ => {
                debug!("search for view {view_id} cancelled");
                drop(state);
                self.emit(DatabaseEvent::SearchFinished {
                    view_id,
                    info: SearchInfo::new(0, 0, 0, 0, effective_order, direction),
                });
                return;
            }
        };

        let info = self.install_view(
            &mut state,
            view_id,
            query,
            folder_results,
            file_results,
            effective_order,
            direction,
        );
        drop(state);
        if let Some(info) = info {
            self.emit(DatabaseEvent::SearchFinished { view_id, info });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install_view(
        &self,
        state: &mut EngineState,
        view_id: u32,
        query: Arc<dyn Query>,
        folder_results: Vec<Arc<Entry>>,
        file_results: Vec<Arc<Entry>>,
        sort_order: SortKey,
        direction: SortDirection,
    ) -> Option<SearchInfo> {
        let previous_selection = state
            .views
            .remove(&view_id)
            .map(SearchView::into_selections);
        match SearchView::new(
            query,
            folder_results,
            file_results,
            previous_selection,
            sort_order,
            None,
            direction,
        ) {
            Ok(view) => {
                let info = view.search_info();
                state.views.insert(view_id, view);
                Some(info)
            }
            Err(error) => {
                warn!("failed to materialise view {view_id}: {error}");
                None
            }
        }
    }

    fn sort(&self, view_id: u32, sort_order: SortKey, direction: SortDirection, cancel: &CancelToken) {
        self.emit(DatabaseEvent::SortStarted { view_id });

        let mut state = self.lock();
        let Some(view) = state.views.get(&view_id) else {
            debug!("sort requested for unknown view {view_id}");
            return;
        };

        if view.sort_order() == sort_order {
            let view = state
                .views
                .get_mut(&view_id)
                .expect("view presence checked above");
            view.set_direction(direction);
            let info = view.search_info();
            drop(state);
            self.emit(DatabaseEvent::SortFinished { view_id, info });
            return;
        }

        let pool = Arc::clone(&state.pool);
        let folder_hint = state
            .store
            .as_ref()
            .and_then(|store| store.get_folders(sort_order));
        let file_hint = state
            .store
            .as_ref()
            .and_then(|store| store.get_files(sort_order));

        let view = state.views.get(&view_id).expect("view presence checked above");
        let files_new = sort::resort_entries(
            view.files().joined(),
            file_hint.as_deref(),
            sort_order,
            &pool,
            cancel,
        );
        let folders_new = if sort::affects_folders(sort_order) {
            sort::resort_entries(
                view.folders().joined(),
                folder_hint.as_deref(),
                sort_order,
                &pool,
                cancel,
            )
        } else {
            // Folders all share the empty extension; keep their order.
            Ok(view.folders().joined())
        };

        let view = state
            .views
            .get_mut(&view_id)
            .expect("view presence checked above");
        match (folders_new, files_new) {
            (Ok(folders), Ok(files)) => {
                if let Err(error) = view.replace_order(folders, files, sort_order, direction) {
                    warn!("failed to re-sort view {view_id}: {error}");
                }
            }
            _ => debug!("sort for view {view_id} cancelled"),
        }
        let info = view.search_info();
        drop(state);
        self.emit(DatabaseEvent::SortFinished { view_id, info });
    }

    fn modify_selection(&self, view_id: u32, change: SelectionChange) {
        let mut state = self.lock();
        let Some(view) = state.views.get_mut(&view_id) else {
            debug!("selection change for unknown view {view_id}");
            return;
        };
        view.modify_selection(change);
        let info = view.search_info();
        drop(state);
        self.emit(DatabaseEvent::SelectionChanged { view_id, info });
    }

    fn item_info(&self, view_id: u32, idx: u32, flags: EntryInfoFlags) {
        let state = self.lock();
        let info = entry_info_in(&state, view_id, idx, flags);
        drop(state);
        match info {
            Ok(info) => self.emit(DatabaseEvent::ItemInfoReady { view_id, info }),
            Err(error) => debug!("item info for view {view_id} idx {idx}: {error}"),
        }
    }

    /// Apply one bracketed batch of index events under a single lock
    /// acquisition, then publish a single `database-changed`.
    fn monitor_batch(&self, index_id: u32, events: Vec<IndexEvent>) {
        let mut state = self.lock();
        let EngineState { store, views, .. } = &mut *state;
        let Some(store) = store.as_mut() else {
            return;
        };
        let Some(index) = store.index_by_id(index_id) else {
            debug!("event batch for index {index_id} not in the current store");
            return;
        };

        let mut changed = false;
        for event in events {
            match event {
                IndexEvent::StartModifying
                | IndexEvent::EndModifying
                | IndexEvent::ScanStarted
                | IndexEvent::ScanFinished
                | IndexEvent::MonitoringStarted => {}
                IndexEvent::MonitoringFinished => {
                    if let Some((folders, files)) = store.remove_index(index_id) {
                        warn!("root index {index_id} stopped, dropping its entries");
                        for view in views.values_mut() {
                            view.on_deleted(&folders, false);
                            view.on_deleted(&files, false);
                        }
                        changed = true;
                    }
                }
                IndexEvent::EntryCreated { folders, files } => {
                    store.add_entries(&folders, true);
                    store.add_entries(&files, false);
                    for view in views.values_mut() {
                        let aliased_folders = store.has_container(view.folders());
                        let aliased_files = store.has_container(view.files());
                        view.on_created(&folders, aliased_folders);
                        view.on_created(&files, aliased_files);
                    }
                    changed = true;
                }
                IndexEvent::EntryDeleted { folders, files } => {
                    store.remove_folders(&folders, &index);
                    store.remove_files(&files, &index);
                    for view in views.values_mut() {
                        let aliased_folders = store.has_container(view.folders());
                        let aliased_files = store.has_container(view.files());
                        view.on_deleted(&folders, aliased_folders);
                        view.on_deleted(&files, aliased_files);
                    }
                    changed = true;
                }
                IndexEvent::EntryRenamed { from, to } | IndexEvent::EntryMoved { from, to } => {
                    store.remove_entry(&from, &index);
                    store.add_entries(std::slice::from_ref(&to), to.is_folder());
                    for view in views.values_mut() {
                        let aliased = if from.is_folder() {
                            store.has_container(view.folders())
                        } else {
                            store.has_container(view.files())
                        };
                        view.on_replaced(&from, &to, aliased);
                    }
                    changed = true;
                }
                IndexEvent::EntryChanged { entry, size, mtime }
                | IndexEvent::EntryAttributeChanged { entry, size, mtime } => {
                    // Steal with the old attributes still in place, then
                    // mutate and re-insert so attribute-sorted containers
                    // stay ordered.
                    store.remove_entry(&entry, &index);
                    let delta = size as i64 - entry.size() as i64;
                    entry.set_size(size);
                    entry.set_mtime(mtime);
                    propagate_size(entry.parent(), delta);
                    store.add_entries(std::slice::from_ref(&entry), entry.is_folder());
                    for view in views.values_mut() {
                        let aliased = if entry.is_folder() {
                            store.has_container(view.folders())
                        } else {
                            store.has_container(view.files())
                        };
                        view.on_attributes_changed(&entry, aliased);
                    }
                    changed = true;
                }
            }
        }

        if changed {
            let info = database_info(&state);
            drop(state);
            self.emit(DatabaseEvent::DatabaseChanged(info));
        }
    }
}
