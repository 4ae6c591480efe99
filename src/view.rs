//! Search views: named, persistent, selectable result sets.
//!
//! A view owns private containers over the entries matching its query,
//! folded for positional access as `[folders…, files…]` (reversed when the
//! direction is descending), plus one selection set per entry type keyed by
//! entry identity.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::container::EntriesContainer;
use crate::entry::{Entry, EntryKind, entry_key};
use crate::error::Result;
use crate::info::SearchInfo;
use crate::query::Query;
use crate::sort::{SortDirection, SortKey};

/// Selection mutation kinds. Range endpoints are accepted in either order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    Clear,
    All,
    Invert,
    Select(u32),
    Toggle(u32),
    SelectRange(u32, u32),
    ToggleRange(u32, u32),
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Selection {
    keys: HashSet<usize>,
}

impl Selection {
    fn select(&mut self, entry: &Arc<Entry>) {
        self.keys.insert(entry_key(entry));
    }

    fn unselect(&mut self, entry: &Arc<Entry>) {
        self.keys.remove(&entry_key(entry));
    }

    fn toggle(&mut self, entry: &Arc<Entry>) {
        let key = entry_key(entry);
        if !self.keys.insert(key) {
            self.keys.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    #[must_use]
    fn is_selected(&self, entry: &Arc<Entry>) -> bool {
        self.keys.contains(&entry_key(entry))
    }

    #[must_use]
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn retain_present(&mut self, entries: &[Arc<Entry>]) {
        let live: HashSet<usize> = entries.iter().map(entry_key).collect();
        self.keys.retain(|key| live.contains(key));
    }
}

pub(crate) struct SearchView {
    query: Arc<dyn Query>,
    folders: Arc<EntriesContainer>,
    files: Arc<EntriesContainer>,
    direction: SortDirection,
    folder_selection: Selection,
    file_selection: Selection,
}

impl SearchView {
    /// Materialise a view over already-sorted result entries. A previous
    /// view's selections may be carried over; entries no longer present in
    /// the new result are dropped from them.
    pub(crate) fn new(
        query: Arc<dyn Query>,
        folder_entries: Vec<Arc<Entry>>,
        file_entries: Vec<Arc<Entry>>,
        previous_selection: Option<(Selection, Selection)>,
        sort_order: SortKey,
        secondary_sort_order: Option<SortKey>,
        direction: SortDirection,
    ) -> Result<Self> {
        let noop = CancelToken::new();
        let (mut folder_selection, mut file_selection) = previous_selection.unwrap_or_default();
        folder_selection.retain_present(&folder_entries);
        file_selection.retain_present(&file_entries);

        let folders = Arc::new(EntriesContainer::from_entries(
            folder_entries,
            true,
            sort_order,
            secondary_sort_order,
            EntryKind::Folder,
            &noop,
        )?);
        let files = Arc::new(EntriesContainer::from_entries(
            file_entries,
            true,
            sort_order,
            secondary_sort_order,
            EntryKind::File,
            &noop,
        )?);

        Ok(Self {
            query,
            folders,
            files,
            direction,
            folder_selection,
            file_selection,
        })
    }

    /// The sort keys live with the containers; folders and files always
    /// share them.
    #[must_use]
    pub(crate) fn sort_order(&self) -> SortKey {
        self.files.sort_key()
    }

    #[must_use]
    pub(crate) fn num_folders(&self) -> usize {
        self.folders.num_entries()
    }

    #[must_use]
    pub(crate) fn num_files(&self) -> usize {
        self.files.num_entries()
    }

    #[must_use]
    pub(crate) fn folders(&self) -> &Arc<EntriesContainer> {
        &self.folders
    }

    #[must_use]
    pub(crate) fn files(&self) -> &Arc<EntriesContainer> {
        &self.files
    }

    /// Entry at `idx` in the folded `[folders…, files…]` order, walked from
    /// the other end when the direction is descending.
    #[must_use]
    pub(crate) fn get_entry(&self, idx: u32) -> Option<Arc<Entry>> {
        let num_folders = self.num_folders();
        let total = num_folders + self.num_files();
        let mut idx = idx as usize;
        if idx >= total {
            return None;
        }
        if self.direction == SortDirection::Descending {
            idx = total - idx - 1;
        }
        if idx < num_folders {
            self.folders.get(idx)
        } else {
            self.files.get(idx - num_folders)
        }
    }

    #[must_use]
    pub(crate) fn is_selected(&self, entry: &Arc<Entry>) -> bool {
        match entry.kind() {
            EntryKind::Folder => self.folder_selection.is_selected(entry),
            EntryKind::File => self.file_selection.is_selected(entry),
        }
    }

    fn selection_for(&mut self, kind: EntryKind) -> &mut Selection {
        match kind {
            EntryKind::Folder => &mut self.folder_selection,
            EntryKind::File => &mut self.file_selection,
        }
    }

    fn select_at(&mut self, idx: u32) {
        if let Some(entry) = self.get_entry(idx) {
            self.selection_for(entry.kind()).select(&entry);
        }
    }

    fn toggle_at(&mut self, idx: u32) {
        if let Some(entry) = self.get_entry(idx) {
            self.selection_for(entry.kind()).toggle(&entry);
        }
    }

    pub(crate) fn modify_selection(&mut self, change: SelectionChange) {
        match change {
            SelectionChange::Clear => {
                self.folder_selection.clear();
                self.file_selection.clear();
            }
            SelectionChange::All => {
                for entry in self.folders.joined() {
                    self.folder_selection.select(&entry);
                }
                for entry in self.files.joined() {
                    self.file_selection.select(&entry);
                }
            }
            SelectionChange::Invert => {
                for entry in self.folders.joined() {
                    self.folder_selection.toggle(&entry);
                }
                for entry in self.files.joined() {
                    self.file_selection.toggle(&entry);
                }
            }
            SelectionChange::Select(idx) => self.select_at(idx),
            SelectionChange::Toggle(idx) => self.toggle_at(idx),
            SelectionChange::SelectRange(a, b) => {
                for idx in a.min(b)..=a.max(b) {
                    self.select_at(idx);
                }
            }
            SelectionChange::ToggleRange(a, b) => {
                for idx in a.min(b)..=a.max(b) {
                    self.toggle_at(idx);
                }
            }
        }
    }

    /// Swap in re-sorted contents; the entries must already be in
    /// `sort_order`.
    pub(crate) fn replace_order(
        &mut self,
        folder_entries: Vec<Arc<Entry>>,
        file_entries: Vec<Arc<Entry>>,
        sort_order: SortKey,
        direction: SortDirection,
    ) -> Result<()> {
        let noop = CancelToken::new();
        self.folders = Arc::new(EntriesContainer::from_entries(
            folder_entries,
            true,
            sort_order,
            None,
            EntryKind::Folder,
            &noop,
        )?);
        self.files = Arc::new(EntriesContainer::from_entries(
            file_entries,
            true,
            sort_order,
            None,
            EntryKind::File,
            &noop,
        )?);
        self.direction = direction;
        Ok(())
    }

    pub(crate) fn set_direction(&mut self, direction: SortDirection) {
        self.direction = direction;
    }

    /// Hand the selection sets to a replacement view.
    #[must_use]
    pub(crate) fn into_selections(self) -> (Selection, Selection) {
        (self.folder_selection, self.file_selection)
    }

    #[must_use]
    pub(crate) fn search_info(&self) -> SearchInfo {
        SearchInfo::new(
            self.num_files() as u32,
            self.num_folders() as u32,
            self.file_selection.len() as u32,
            self.folder_selection.len() as u32,
            self.sort_order(),
            self.direction,
        )
    }

    fn container_for(&self, kind: EntryKind) -> &Arc<EntriesContainer> {
        match kind {
            EntryKind::Folder => &self.folders,
            EntryKind::File => &self.files,
        }
    }

    /// The store reported new entries. Entries whose owning container is one
    /// of the view's own (aliased) were already inserted by the store.
    pub(crate) fn on_created(&mut self, entries: &[Arc<Entry>], aliased: bool) {
        if aliased {
            return;
        }
        for entry in entries {
            if entry.is_root() || !self.query.is_match(entry) {
                continue;
            }
            self.container_for(entry.kind()).insert(Arc::clone(entry));
        }
    }

    /// The store reported deleted entries. The selection is cleaned up even
    /// when the container is aliased and the store already stole the entry.
    pub(crate) fn on_deleted(&mut self, entries: &[Arc<Entry>], aliased: bool) {
        for entry in entries {
            if !aliased {
                self.container_for(entry.kind()).steal(entry);
            }
            self.selection_for(entry.kind()).unselect(entry);
        }
    }

    /// A rename or move replaced `from` with `to`; the selection follows the
    /// surviving entry.
    pub(crate) fn on_replaced(&mut self, from: &Arc<Entry>, to: &Arc<Entry>, aliased: bool) {
        debug_assert_eq!(from.kind(), to.kind());
        if !aliased {
            self.container_for(from.kind()).steal(from);
            if !to.is_root() && self.query.is_match(to) {
                self.container_for(to.kind()).insert(Arc::clone(to));
            }
        }
        let was_selected = self.is_selected(from);
        let selection = self.selection_for(from.kind());
        selection.unselect(from);
        if was_selected && self.query.is_match(to) {
            self.selection_for(to.kind()).select(to);
        }
    }

    /// An entry's attributes changed; re-place it so attribute-sorted views
    /// stay ordered. Selection is untouched (identity is stable).
    pub(crate) fn on_attributes_changed(&mut self, entry: &Arc<Entry>, aliased: bool) {
        if aliased {
            return;
        }
        let container = self.container_for(entry.kind());
        if container.steal(entry) {
            container.insert(Arc::clone(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MatchEverything;

    fn view_over(folder_names: &[&str], file_names: &[&str]) -> (Arc<Entry>, SearchView) {
        let root = Entry::new_root("/", 0, 0, 0);
        let mut folders: Vec<Arc<Entry>> = folder_names
            .iter()
            .map(|name| Entry::new_folder(name, 0, 0, 0, Arc::clone(&root)))
            .collect();
        let mut files: Vec<Arc<Entry>> = file_names
            .iter()
            .map(|name| Entry::new_file(name, 0, 0, Arc::clone(&root)))
            .collect();
        folders.sort_by(|a, b| a.name().cmp(b.name()));
        files.sort_by(|a, b| a.name().cmp(b.name()));
        let view = SearchView::new(
            Arc::new(MatchEverything),
            folders,
            files,
            None,
            SortKey::Name,
            None,
            SortDirection::Ascending,
        )
        .unwrap();
        (root, view)
    }

    #[test]
    fn get_entry_folds_folders_before_files() {
        let (_root, view) = view_over(&["d"], &["a.txt", "b.txt"]);
        assert_eq!(view.get_entry(0).unwrap().name(), "d");
        assert_eq!(view.get_entry(1).unwrap().name(), "a.txt");
        assert_eq!(view.get_entry(2).unwrap().name(), "b.txt");
        assert!(view.get_entry(3).is_none());
    }

    #[test]
    fn descending_direction_walks_from_the_other_end() {
        let (_root, mut view) = view_over(&[], &["a", "b", "c"]);
        view.direction = SortDirection::Descending;
        assert_eq!(view.get_entry(0).unwrap().name(), "c");
        assert_eq!(view.get_entry(2).unwrap().name(), "a");
    }

    #[test]
    fn select_then_unselect_restores_the_set() {
        let (_root, mut view) = view_over(&[], &["a", "b"]);
        view.modify_selection(SelectionChange::Select(0));
        assert_eq!(view.search_info().num_selected_files(), 1);
        view.modify_selection(SelectionChange::Toggle(0));
        assert_eq!(view.search_info().num_selected_files(), 0);
    }

    #[test]
    fn toggle_range_twice_is_identity() {
        let (_root, mut view) = view_over(&["d"], &["a", "b"]);
        view.modify_selection(SelectionChange::Select(1));
        let before = view.search_info();
        view.modify_selection(SelectionChange::ToggleRange(0, 2));
        view.modify_selection(SelectionChange::ToggleRange(0, 2));
        let after = view.search_info();
        assert_eq!(before.num_selected_files(), after.num_selected_files());
        assert_eq!(before.num_selected_folders(), after.num_selected_folders());
    }

    #[test]
    fn range_endpoints_commute() {
        let (_root, mut view) = view_over(&[], &["a", "b", "c", "d"]);
        view.modify_selection(SelectionChange::SelectRange(3, 1));
        assert_eq!(view.search_info().num_selected_files(), 3);
        view.modify_selection(SelectionChange::Clear);
        view.modify_selection(SelectionChange::SelectRange(1, 3));
        assert_eq!(view.search_info().num_selected_files(), 3);
    }

    #[test]
    fn invert_flips_both_types() {
        let (_root, mut view) = view_over(&["d"], &["a"]);
        view.modify_selection(SelectionChange::Select(0));
        view.modify_selection(SelectionChange::Invert);
        let info = view.search_info();
        assert_eq!(info.num_selected_folders(), 0);
        assert_eq!(info.num_selected_files(), 1);
    }

    #[test]
    fn created_entries_join_matching_views() {
        let (root, mut view) = view_over(&[], &["a", "c"]);
        let created = Entry::new_file("b", 0, 0, Arc::clone(&root));
        view.on_created(&[created], false);
        assert_eq!(view.num_files(), 3);
        assert_eq!(view.get_entry(1).unwrap().name(), "b");
    }

    #[test]
    fn deleted_entries_leave_container_and_selection() {
        let (_root, mut view) = view_over(&[], &["a", "b"]);
        view.modify_selection(SelectionChange::Select(0));
        let doomed = view.get_entry(0).unwrap();
        view.on_deleted(&[Arc::clone(&doomed)], false);
        assert_eq!(view.num_files(), 1);
        assert_eq!(view.search_info().num_selected_files(), 0);

        // Aliased containers only drop the selection.
        let survivor = view.get_entry(0).unwrap();
        view.modify_selection(SelectionChange::Select(0));
        view.on_deleted(&[Arc::clone(&survivor)], true);
        assert_eq!(view.num_files(), 1);
        assert_eq!(view.search_info().num_selected_files(), 0);
    }

    #[test]
    fn replacement_transfers_the_selection() {
        let (root, mut view) = view_over(&[], &["old"]);
        view.modify_selection(SelectionChange::Select(0));
        let from = view.get_entry(0).unwrap();
        let to = Entry::new_file("new", 0, 0, Arc::clone(&root));
        view.on_replaced(&from, &to, false);
        assert_eq!(view.num_files(), 1);
        assert!(view.is_selected(&to));
        assert!(!view.is_selected(&from));
    }

    #[test]
    fn previous_selection_survives_a_research_for_surviving_entries() {
        let (root, mut view) = view_over(&[], &["a", "b"]);
        view.modify_selection(SelectionChange::All);
        let kept = view.get_entry(0).unwrap();

        let rebuilt = SearchView::new(
            Arc::new(MatchEverything),
            Vec::new(),
            vec![Arc::clone(&kept)],
            Some((view.folder_selection.clone(), view.file_selection.clone())),
            SortKey::Name,
            None,
            SortDirection::Ascending,
        )
        .unwrap();
        assert_eq!(rebuilt.search_info().num_selected_files(), 1);
        assert!(rebuilt.is_selected(&kept));
    }
}
